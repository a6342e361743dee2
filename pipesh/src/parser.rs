//! Line parser: turns one line of input into a [`Pipeline`].
//!
//! Grammar: words separated by unquoted whitespace, with the unquoted
//! operators `|`, `<`, `>` and `>>`. Quoting follows the usual shell rules
//! (single quotes are literal, double quotes honour `\"` and `\\`, a bare
//! backslash escapes the next character). Nothing is expanded.

use thiserror::Error;

use crate::pipeline::{OutputMode, Pipeline, Stage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("trailing backslash")]
    TrailingEscape,
    #[error("missing file name after '{0}'")]
    MissingRedirectTarget(&'static str),
    #[error("missing command")]
    EmptyCommand,
    #[error("more than one input redirection")]
    DuplicateInput,
    #[error("more than one output redirection")]
    DuplicateOutput,
    #[error("output redirected to a file and to a pipe")]
    ConflictingOutput,
}

/// Source of parsed pipelines for the dispatcher.
pub trait CommandParser {
    /// `Ok(None)` means the line was blank.
    fn parse(&self, line: &str) -> Result<Option<Pipeline>, ParseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    Less,
    Great,
    DGreat,
}

impl Token {
    fn operator(&self) -> &'static str {
        match self {
            Token::Pipe => "|",
            Token::Less => "<",
            Token::Great => ">",
            Token::DGreat => ">>",
            Token::Word(_) => "",
        }
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    let mut word = String::new();
    // a quoted empty string ('') is still a word
    let mut in_word = false;

    fn flush(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            '|' => {
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Pipe);
            }
            '<' => {
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Less);
            }
            '>' => {
                flush(&mut tokens, &mut word, &mut in_word);
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::DGreat);
                } else {
                    tokens.push(Token::Great);
                }
            }
            '\\' => {
                let escaped = chars.next().ok_or(ParseError::TrailingEscape)?;
                word.push(escaped);
                in_word = true;
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(q) => word.push(q),
                        None => return Err(ParseError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => word.push(e),
                            Some(other) => {
                                word.push('\\');
                                word.push(other);
                            }
                            None => return Err(ParseError::UnterminatedQuote),
                        },
                        Some(q) => word.push(q),
                        None => return Err(ParseError::UnterminatedQuote),
                    }
                }
            }
            other => {
                word.push(other);
                in_word = true;
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

#[derive(Debug, Default)]
struct Segment {
    argv: Vec<String>,
    input: Option<String>,
    output: Option<OutputMode>,
}

fn parse_segment(tokens: &[Token]) -> Result<Segment, ParseError> {
    let mut seg = Segment::default();
    let mut iter = tokens.iter();
    while let Some(tok) = iter.next() {
        match tok {
            Token::Word(w) => seg.argv.push(w.clone()),
            Token::Less | Token::Great | Token::DGreat => {
                let target = match iter.next() {
                    Some(Token::Word(w)) => w.clone(),
                    _ => return Err(ParseError::MissingRedirectTarget(tok.operator())),
                };
                match tok {
                    Token::Less => {
                        if seg.input.replace(target).is_some() {
                            return Err(ParseError::DuplicateInput);
                        }
                    }
                    _ => {
                        let mode = if *tok == Token::DGreat {
                            OutputMode::Append(target.into())
                        } else {
                            OutputMode::Truncate(target.into())
                        };
                        if seg.output.replace(mode).is_some() {
                            return Err(ParseError::DuplicateOutput);
                        }
                    }
                }
            }
            Token::Pipe => unreachable!("segments are split on pipes"),
        }
    }
    if seg.argv.is_empty() {
        return Err(ParseError::EmptyCommand);
    }
    Ok(seg)
}

/// Default parser for interactive input.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineParser;

impl CommandParser for LineParser {
    fn parse(&self, line: &str) -> Result<Option<Pipeline>, ParseError> {
        let tokens = tokenize(line)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        let segments: Vec<&[Token]> = tokens.split(|t| *t == Token::Pipe).collect();
        let last = segments.len() - 1;
        let mut stages = Vec::with_capacity(segments.len());
        for (i, toks) in segments.into_iter().enumerate() {
            let seg = parse_segment(toks)?;
            let output = match (seg.output, i == last) {
                (Some(_), false) => return Err(ParseError::ConflictingOutput),
                (Some(mode), true) => mode,
                (None, false) => OutputMode::Pipe,
                (None, true) => OutputMode::Inherit,
            };
            let mut stage = Stage::new(seg.argv).with_output(output);
            if let Some(path) = seg.input {
                stage = stage.with_input(path);
            }
            stages.push(stage);
        }
        // wiring is correct by construction; an error here is a parser bug
        Pipeline::new(stages).map(Some).map_err(|_| ParseError::EmptyCommand)
    }
}
