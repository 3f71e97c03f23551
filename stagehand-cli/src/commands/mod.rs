// CLI subcommands

pub mod graph;
pub mod prune;
pub mod run;
pub mod validate;

use std::collections::HashMap;
use std::path::Path;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use pipeline_engine::{PipelineDefinition, PipelineParser, TriggerEvent};

/// Parse `--var NAME=VALUE` flags
pub fn parse_variables(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut variables = HashMap::new();
    for var in raw {
        match var.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                variables.insert(name.to_string(), value.to_string());
            }
            _ => bail!("Invalid variable format '{}'. Expected NAME=VALUE", var),
        }
    }
    Ok(variables)
}

pub fn parse_event(raw: &str) -> Result<TriggerEvent> {
    raw.parse().map_err(|e: String| eyre!(e))
}

/// Read and parse a pipeline file
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    if !path.exists() {
        bail!("Pipeline file not found: {}", path.display());
    }
    PipelineParser::parse_file(path).map_err(|e| eyre!("{}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variables() {
        let vars = parse_variables(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["B"], "x=y");
    }

    #[test]
    fn test_parse_variables_rejects_missing_equals() {
        assert!(parse_variables(&["A".to_string()]).is_err());
        assert!(parse_variables(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_parse_event() {
        assert_eq!(parse_event("mr").unwrap(), TriggerEvent::MergeRequest);
        assert!(parse_event("nope").is_err());
    }
}
