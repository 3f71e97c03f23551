// Expression Engine Lexer
// Tokenizes rule conditions: $VAR, "strings", /regex/flags, == != =~ !~ && || !

use std::fmt;

/// Token types for rule conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    String(String),
    Regex { pattern: String, flags: String },

    // Variable reference ($NAME)
    Variable(String),

    // Operators
    Eq,       // ==
    Ne,       // !=
    Match,    // =~
    NotMatch, // !~
    And,      // &&
    Or,       // ||
    Not,      // !

    // Delimiters
    LParen, // (
    RParen, // )

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Regex { pattern, flags } => write!(f, "/{}/{}", pattern, flags),
            Token::Variable(name) => write!(f, "${}", name),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Match => write!(f, "=~"),
            Token::NotMatch => write!(f, "!~"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

/// Lexer for rule conditions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            if token == Token::Eof {
                tokens.push(token);
                break;
            }
            tokens.push(token);
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }

            '=' => {
                self.advance();
                match self.peek_char() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::Eq)
                    }
                    Some('~') => {
                        self.advance();
                        Ok(Token::Match)
                    }
                    _ => Err(self.error("expected '==' or '=~' operator")),
                }
            }
            '!' => {
                self.advance();
                match self.peek_char() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::Ne)
                    }
                    Some('~') => {
                        self.advance();
                        Ok(Token::NotMatch)
                    }
                    _ => Ok(Token::Not),
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    Ok(Token::And)
                } else {
                    Err(self.error("expected '&&' operator"))
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    Ok(Token::Or)
                } else {
                    Err(self.error("expected '||' operator"))
                }
            }

            '"' | '\'' => self.read_string(ch),
            '/' => self.read_regex(),
            '$' => self.read_variable(),

            'a'..='z' | 'A'..='Z' => self.read_keyword(),

            _ => Err(self.error(&format!("unexpected character: '{}'", ch))),
        }
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            message: message.to_string(),
            position: self.position,
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        self.advance(); // consume opening quote

        let mut value = String::new();

        loop {
            match self.advance() {
                Some((_, '\\')) => match self.advance() {
                    Some((_, escaped)) => value.push(escaped),
                    None => return Err(self.error("unterminated string")),
                },
                Some((_, c)) if c == quote => break,
                Some((_, c)) => value.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }

        Ok(Token::String(value))
    }

    /// Read `/pattern/flags`; `\/` inside the pattern is a literal slash
    fn read_regex(&mut self) -> Result<Token, LexError> {
        self.advance(); // consume opening slash

        let mut pattern = String::new();

        loop {
            match self.advance() {
                Some((_, '\\')) => match self.advance() {
                    Some((_, '/')) => pattern.push('/'),
                    Some((_, escaped)) => {
                        pattern.push('\\');
                        pattern.push(escaped);
                    }
                    None => return Err(self.error("unterminated regex")),
                },
                Some((_, '/')) => break,
                Some((_, c)) => pattern.push(c),
                None => return Err(self.error("unterminated regex")),
            }
        }

        let mut flags = String::new();
        while let Some(c) = self.peek_char().filter(|c| c.is_ascii_alphabetic()) {
            flags.push(c);
            self.advance();
        }

        Ok(Token::Regex { pattern, flags })
    }

    fn read_variable(&mut self) -> Result<Token, LexError> {
        self.advance(); // consume '$'

        let braced = self.peek_char() == Some('{');
        if braced {
            self.advance();
        }

        let mut name = String::new();
        while let Some(c) = self
            .peek_char()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            name.push(c);
            self.advance();
        }

        if braced && self.advance().map(|(_, c)| c) != Some('}') {
            return Err(self.error("expected '}' after variable name"));
        }
        if name.is_empty() {
            return Err(self.error("expected variable name after '$'"));
        }

        Ok(Token::Variable(name))
    }

    fn read_keyword(&mut self) -> Result<Token, LexError> {
        let mut ident = String::new();

        while let Some(c) = self.peek_char().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
            ident.push(c);
            self.advance();
        }

        match ident.as_str() {
            "null" => Ok(Token::Null),
            _ => Err(self.error(&format!(
                "unexpected word '{}' (variables start with '$', strings are quoted)",
                ident
            ))),
        }
    }
}
