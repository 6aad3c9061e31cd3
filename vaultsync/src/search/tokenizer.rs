//! Search keyword tokenizer and FTS5 query builder
//!
//! Only two token shapes ever reach the MATCH expression:
//! a single CJK character as a quoted phrase (`"测"`) and a run of letters,
//! digits or underscores as a quoted prefix (`"hello"*`). Every other
//! character separates tokens, so operator syntax in user input cannot leak
//! into the query.

use unicode_script::{Script, UnicodeScript};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// One Han, Hiragana, Katakana or Hangul character
    Cjk(char),
    /// Alphanumeric run, matched as a prefix
    Word(String),
}

impl Token {
    fn render(&self) -> String {
        match self {
            Token::Cjk(c) => format!("\"{}\"", c),
            Token::Word(w) => format!("\"{}\"*", w),
        }
    }
}

pub fn is_cjk(c: char) -> bool {
    matches!(
        c.script(),
        Script::Han | Script::Hiragana | Script::Katakana | Script::Hangul
    )
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub fn tokenize(keyword: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    };

    for c in keyword.chars() {
        if is_cjk(c) {
            flush(&mut word, &mut tokens);
            tokens.push(Token::Cjk(c));
        } else if is_word_char(c) {
            word.push(c);
        } else {
            flush(&mut word, &mut tokens);
        }
    }
    flush(&mut word, &mut tokens);

    tokens
}

/// MATCH expression for a keyword, or `None` when nothing is searchable.
pub fn build_match_query(keyword: &str) -> Option<String> {
    let tokens = tokenize(keyword);
    if tokens.is_empty() {
        return None;
    }

    Some(
        tokens
            .iter()
            .map(Token::render)
            .collect::<Vec<_>>()
            .join(" AND "),
    )
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
