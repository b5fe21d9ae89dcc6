//
// build/constraint.rs
//
// Parsing and evaluation of //go:build and // +build constraints
//

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("unexpected token {0:?} in build constraint")]
    UnexpectedToken(String),
    #[error("unexpected end of build constraint")]
    UnexpectedEnd,
    #[error("invalid character {0:?} in build constraint")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintExpr {
    Tag(String),
    Not(Box<ConstraintExpr>),
    And(Box<ConstraintExpr>, Box<ConstraintExpr>),
    Or(Box<ConstraintExpr>, Box<ConstraintExpr>),
}

impl ConstraintExpr {
    pub fn eval(&self, has_tag: &dyn Fn(&str) -> bool) -> bool {
        match self {
            ConstraintExpr::Tag(tag) => has_tag(tag),
            ConstraintExpr::Not(inner) => !inner.eval(has_tag),
            ConstraintExpr::And(a, b) => a.eval(has_tag) && b.eval(has_tag),
            ConstraintExpr::Or(a, b) => a.eval(has_tag) || b.eval(has_tag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn is_tag_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '.'
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConstraintError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(ch) {
                    return Err(ConstraintError::InvalidChar(ch));
                }
                tokens.push(if ch == '&' { Token::And } else { Token::Or });
            }
            c if is_tag_char(c) => {
                let mut tag = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_tag_char(c) {
                        break;
                    }
                    tag.push(c);
                    chars.next();
                }
                tokens.push(Token::Tag(tag));
            }
            other => return Err(ConstraintError::InvalidChar(other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<ConstraintExpr, ConstraintError> {
        let mut expr = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            expr = ConstraintExpr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<ConstraintExpr, ConstraintError> {
        let mut expr = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            expr = ConstraintExpr::And(Box::new(expr), Box::new(self.not()?));
        }
        Ok(expr)
    }

    fn not(&mut self) -> Result<ConstraintExpr, ConstraintError> {
        match self.next() {
            Some(Token::Not) => Ok(ConstraintExpr::Not(Box::new(self.not()?))),
            Some(Token::LParen) => {
                let expr = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    Some(other) => Err(ConstraintError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ConstraintError::UnexpectedEnd),
                }
            }
            Some(Token::Tag(tag)) => Ok(ConstraintExpr::Tag(tag)),
            Some(other) => Err(ConstraintError::UnexpectedToken(format!("{:?}", other))),
            None => Err(ConstraintError::UnexpectedEnd),
        }
    }
}

/// Parse the expression following `//go:build`.
pub fn parse_go_build(expr: &str) -> Result<ConstraintExpr, ConstraintError> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
    };
    let expr = parser.or()?;
    match parser.next() {
        None => Ok(expr),
        Some(token) => Err(ConstraintError::UnexpectedToken(format!("{:?}", token))),
    }
}

/// Parse the text following `// +build`: space-separated options are ORed,
/// comma-separated terms within an option are ANDed.
pub fn parse_plus_build(line: &str) -> Result<ConstraintExpr, ConstraintError> {
    let mut result: Option<ConstraintExpr> = None;
    for option in line.split_whitespace() {
        let mut conjunction: Option<ConstraintExpr> = None;
        for term in option.split(',') {
            let (negated, tag) = match term.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, term),
            };
            if tag.is_empty() || !tag.chars().all(is_tag_char) {
                return Err(ConstraintError::UnexpectedToken(term.to_string()));
            }
            let mut atom = ConstraintExpr::Tag(tag.to_string());
            if negated {
                atom = ConstraintExpr::Not(Box::new(atom));
            }
            conjunction = Some(match conjunction {
                Some(prev) => ConstraintExpr::And(Box::new(prev), Box::new(atom)),
                None => atom,
            });
        }
        if let Some(conjunction) = conjunction {
            result = Some(match result {
                Some(prev) => ConstraintExpr::Or(Box::new(prev), Box::new(conjunction)),
                None => conjunction,
            });
        }
    }
    result.ok_or(ConstraintError::UnexpectedEnd)
}

/// Constraint lines found in a file header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderConstraints {
    pub go_build: Option<String>,
    pub plus_build: Vec<String>,
}

/// Collect constraint comments from the part of a Go file that precedes the
/// package clause. Constraints after the package clause are ignored.
pub fn header_constraints(source: &str) -> HeaderConstraints {
    let mut found = HeaderConstraints::default();
    let mut in_block_comment = false;
    for line in source.lines() {
        let trimmed = line.trim();
        if in_block_comment {
            if trimmed.contains("*/") {
                in_block_comment = false;
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("/*") {
            in_block_comment = !trimmed.contains("*/");
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("//") else {
            break;
        };
        if let Some(expr) = comment.strip_prefix("go:build") {
            if found.go_build.is_none() && (expr.is_empty() || expr.starts_with(char::is_whitespace)) {
                found.go_build = Some(expr.trim().to_string());
            }
        } else if let Some(rest) = comment.trim_start().strip_prefix("+build") {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                found.plus_build.push(rest.trim().to_string());
            }
        }
    }
    found
}

/// Evaluate a file's header constraints. `//go:build` wins over `// +build`.
pub fn header_satisfied(
    constraints: &HeaderConstraints,
    has_tag: &dyn Fn(&str) -> bool,
) -> Result<bool, ConstraintError> {
    if let Some(expr) = &constraints.go_build {
        return Ok(parse_go_build(expr)?.eval(has_tag));
    }
    for line in &constraints.plus_build {
        if !parse_plus_build(line)?.eval(has_tag) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(set: &'static [&'static str]) -> impl Fn(&str) -> bool {
        move |t: &str| set.iter().any(|s| *s == t)
    }

    #[test]
    fn test_go_build_precedence() {
        let expr = parse_go_build("linux && amd64 || darwin").unwrap();
        assert!(expr.eval(&tags(&["linux", "amd64"])));
        assert!(expr.eval(&tags(&["darwin"])));
        assert!(!expr.eval(&tags(&["linux", "arm64"])));
    }

    #[test]
    fn test_go_build_not_and_parens() {
        let expr = parse_go_build("!windows && (cgo || purego)").unwrap();
        assert!(expr.eval(&tags(&["linux", "purego"])));
        assert!(!expr.eval(&tags(&["windows", "cgo"])));
        assert!(!expr.eval(&tags(&["linux"])));
    }

    #[test]
    fn test_go_build_errors() {
        assert!(parse_go_build("linux &&").is_err());
        assert!(parse_go_build("(linux").is_err());
        assert!(parse_go_build("linux & amd64").is_err());
        assert!(parse_go_build("linux amd64").is_err());
        assert!(parse_go_build("").is_err());
    }

    #[test]
    fn test_plus_build_semantics() {
        let expr = parse_plus_build("linux,386 darwin,!cgo").unwrap();
        assert!(expr.eval(&tags(&["linux", "386"])));
        assert!(expr.eval(&tags(&["darwin"])));
        assert!(!expr.eval(&tags(&["darwin", "cgo"])));
        assert!(!expr.eval(&tags(&["linux"])));
    }

    #[test]
    fn test_header_constraints_stop_at_package() {
        let source = "// Copyright\n\n//go:build linux\n// +build linux\n\npackage a\n//go:build windows\n";
        let found = header_constraints(source);
        assert_eq!(found.go_build.as_deref(), Some("linux"));
        assert_eq!(found.plus_build, vec!["linux".to_string()]);
    }

    #[test]
    fn test_header_satisfied_plus_build_lines_are_anded() {
        let source = "// +build linux darwin\n// +build amd64\n\npackage a\n";
        let found = header_constraints(source);
        assert!(header_satisfied(&found, &tags(&["darwin", "amd64"])).unwrap());
        assert!(!header_satisfied(&found, &tags(&["darwin", "arm64"])).unwrap());
    }

    #[test]
    fn test_header_without_constraints() {
        let found = header_constraints("/* block\n comment */\npackage a\n");
        assert_eq!(found, HeaderConstraints::default());
        assert!(header_satisfied(&found, &tags(&[])).unwrap());
    }

    #[test]
    fn test_ignore_tag_excludes() {
        let found = header_constraints("//go:build ignore\n\npackage main\n");
        assert!(!header_satisfied(&found, &tags(&["linux"])).unwrap());
    }
}
