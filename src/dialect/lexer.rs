use super::TranspileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(String),
    QuotedIdent(String),
    Number(String),
    Text(String),
    Date(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

impl Token {
    pub fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, TranspileError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let ch = bytes[pos] as char;
        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        let token = match ch {
            '(' => single(&mut pos, Token::LParen),
            ')' => single(&mut pos, Token::RParen),
            ',' => single(&mut pos, Token::Comma),
            '.' => single(&mut pos, Token::Dot),
            '*' => single(&mut pos, Token::Star),
            '+' => single(&mut pos, Token::Plus),
            '%' => single(&mut pos, Token::Percent),
            '=' => single(&mut pos, Token::Eq),
            '-' => {
                if bytes.get(pos + 1) == Some(&b'-') {
                    return Err(TranspileError::unsupported(source, start, "comments are not allowed"));
                }
                single(&mut pos, Token::Minus)
            }
            '/' => {
                if bytes.get(pos + 1) == Some(&b'*') {
                    return Err(TranspileError::unsupported(source, start, "comments are not allowed"));
                }
                single(&mut pos, Token::Slash)
            }
            '<' => match bytes.get(pos + 1) {
                Some(b'=') => double(&mut pos, Token::Le),
                Some(b'>') => double(&mut pos, Token::Ne),
                _ => single(&mut pos, Token::Lt),
            },
            '>' => match bytes.get(pos + 1) {
                Some(b'=') => double(&mut pos, Token::Ge),
                _ => single(&mut pos, Token::Gt),
            },
            '!' if bytes.get(pos + 1) == Some(&b'=') => double(&mut pos, Token::Ne),
            '\'' => Token::Text(read_delimited(source, &mut pos, '\'', '\'', true)?),
            '"' => Token::QuotedIdent(read_delimited(source, &mut pos, '"', '"', true)?),
            '[' => Token::QuotedIdent(read_delimited(source, &mut pos, '[', ']', true)?),
            '#' => Token::Date(read_delimited(source, &mut pos, '#', '#', false)?),
            c if c.is_ascii_digit() => Token::Number(read_number(bytes, &mut pos)),
            c if c.is_ascii_alphabetic() || c == '_' => Token::Word(read_word(bytes, &mut pos)),
            ';' => return Err(TranspileError::unsupported(source, start, "multiple statements are not allowed")),
            '@' => return Err(TranspileError::unsupported(source, start, "variables are not allowed")),
            _ => return Err(TranspileError::unsupported(source, start, "unexpected character")),
        };
        tokens.push(Spanned { token, pos: start });
    }

    Ok(tokens)
}

fn single(pos: &mut usize, token: Token) -> Token {
    *pos += 1;
    token
}

fn double(pos: &mut usize, token: Token) -> Token {
    *pos += 2;
    token
}

fn read_word(bytes: &[u8], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < bytes.len() && (bytes[*pos].is_ascii_alphanumeric() || bytes[*pos] == b'_') {
        *pos += 1;
    }
    String::from_utf8_lossy(&bytes[start..*pos]).into_owned()
}

fn read_number(bytes: &[u8], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if *pos + 1 < bytes.len() && bytes[*pos] == b'.' && bytes[*pos + 1].is_ascii_digit() {
        *pos += 1;
        while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
            *pos += 1;
        }
    }
    String::from_utf8_lossy(&bytes[start..*pos]).into_owned()
}

/// Reads a delimited run starting at `open`. When `doubled_escape` is set a
/// doubled closing delimiter stands for one literal delimiter.
fn read_delimited(
    source: &str,
    pos: &mut usize,
    open: char,
    close: char,
    doubled_escape: bool,
) -> Result<String, TranspileError> {
    let start = *pos;
    let mut out = String::new();
    let mut chars = source[start + open.len_utf8()..].char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        if ch == close {
            if doubled_escape && chars.peek().map(|(_, next)| *next) == Some(close) {
                chars.next();
                out.push(close);
                continue;
            }
            *pos = start + open.len_utf8() + offset + close.len_utf8();
            return Ok(out);
        }
        out.push(ch);
    }

    Err(TranspileError::unsupported(source, start, "unterminated literal or identifier"))
}
