//! The `.cnf` surface-syntax parser.
//!
//! Promise sources are s-expressions. A file holds top-level definitions
//! `(name form...)`; forms are builtin promises such as `(test "/bin/true")`
//! or references to other named promises by head symbol. Argument positions
//! accept quoted strings, bare words, the bracket atoms `[var:NAME]`,
//! `[env:NAME]` and `[arg:N]`, and `(join ...)` concatenations. `#` starts
//! a line comment.
//!
//! References are resolved here: a use site of a named promise becomes a
//! `Promise::Named` node carrying a copy of the definition's body and the
//! call-site arguments. Definitions may reference each other in any order
//! and across files; reference cycles are rejected.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{CompileError, Parser, PromiseSet, Source};
use crate::promise::{Argument, Builtin, ConstructError, Promise};

/// Parse failure with source position where available.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{file}:{line}: {message}")]
    Syntax {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{file}:{line}: {source}")]
    Construct {
        file: PathBuf,
        line: usize,
        source: ConstructError,
    },

    #[error("promise ({name}) is defined more than once")]
    DuplicateDefinition { name: String },

    #[error("{file}:{line}: unknown promise ({name})")]
    UnknownPromise {
        file: PathBuf,
        line: usize,
        name: String,
    },

    #[error("recursive promise definition ({name})")]
    RecursiveDefinition { name: String },
}

/// The standard parser for `.cnf` sources.
pub struct CnfParser;

impl Parser for CnfParser {
    fn parse(&self, sources: &[Source]) -> Result<PromiseSet, CompileError> {
        let mut defs: HashMap<String, Definition> = HashMap::new();
        for source in sources {
            for form in read_forms(source)? {
                let def = Definition::from_form(source, form)?;
                if defs.contains_key(&def.name) {
                    return Err(ParseError::DuplicateDefinition { name: def.name }.into());
                }
                defs.insert(def.name.clone(), def);
            }
        }

        let mut resolver = Resolver {
            defs: &defs,
            building: HashSet::new(),
            cache: HashMap::new(),
        };
        let mut set = PromiseSet::new();
        let mut names: Vec<&String> = defs.keys().collect();
        names.sort();
        for name in names {
            let body = resolver.body_of(name, &defs[name].file, defs[name].line)?;
            set.insert(
                name.clone(),
                Promise::Named {
                    name: name.clone(),
                    body: Box::new(body),
                    args: Vec::new(),
                },
            );
        }
        Ok(set)
    }
}

/// One parsed node of the s-expression tree.
#[derive(Debug, Clone)]
enum Node {
    List { items: Vec<Node>, line: usize },
    Str(String),
    Word(String),
    Bracket { content: String, line: usize },
}

/// A top-level definition, unresolved.
struct Definition {
    name: String,
    children: Vec<Node>,
    file: PathBuf,
    line: usize,
}

impl Definition {
    fn from_form(source: &Source, form: Node) -> Result<Self, ParseError> {
        let Node::List { items, line } = form else {
            return Err(syntax(source, 0, "expected a top-level definition list"));
        };
        let mut items = items.into_iter();
        let name = match items.next() {
            Some(Node::Word(name)) => name,
            _ => {
                return Err(syntax(
                    source,
                    line,
                    "a definition starts with a promise name",
                ))
            },
        };
        if Builtin::from_head(&name).is_some() || name == "join" {
            return Err(syntax(
                source,
                line,
                format!("({name}) is reserved and cannot be defined"),
            ));
        }
        let children: Vec<Node> = items.collect();
        if children.is_empty() {
            return Err(syntax(source, line, format!("promise ({name}) has no body")));
        }
        Ok(Self {
            name,
            children,
            file: source.path.clone(),
            line,
        })
    }
}

fn syntax(source: &Source, line: usize, message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        file: source.path.clone(),
        line,
        message: message.into(),
    }
}

/// Resolves named references with cycle detection and per-name caching.
struct Resolver<'a> {
    defs: &'a HashMap<String, Definition>,
    building: HashSet<String>,
    cache: HashMap<String, Promise>,
}

impl Resolver<'_> {
    /// The resolved body promise of a definition.
    fn body_of(&mut self, name: &str, at_file: &Path, at_line: usize) -> Result<Promise, ParseError> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached.clone());
        }
        let Some(def) = self.defs.get(name) else {
            return Err(ParseError::UnknownPromise {
                file: at_file.to_path_buf(),
                line: at_line,
                name: name.to_string(),
            });
        };
        if !self.building.insert(name.to_string()) {
            return Err(ParseError::RecursiveDefinition {
                name: name.to_string(),
            });
        }

        let mut children = Vec::with_capacity(def.children.len());
        for node in &def.children {
            match self.build_item(def, node)? {
                Item::Child(p) => children.push(p),
                Item::Arg(_) => {
                    return Err(ParseError::Syntax {
                        file: def.file.clone(),
                        line: def.line,
                        message: format!(
                            "promise ({name}) takes only nested promises in its body"
                        ),
                    })
                },
            }
        }
        let body = if children.len() == 1 {
            children.into_iter().next().expect("checked above")
        } else {
            Promise::And(children)
        };

        self.building.remove(name);
        self.cache.insert(name.to_string(), body.clone());
        Ok(body)
    }

    /// Build a form item: either a child promise or an argument.
    fn build_item(&mut self, def: &Definition, node: &Node) -> Result<Item, ParseError> {
        match node {
            Node::Str(s) | Node::Word(s) => Ok(Item::Arg(Argument::Constant(s.clone()))),
            Node::Bracket { content, line } => {
                Ok(Item::Arg(self.build_bracket(def, content, *line)?))
            },
            Node::List { items, line } => {
                let head = match items.first() {
                    Some(Node::Word(head)) => head.clone(),
                    _ => {
                        return Err(ParseError::Syntax {
                            file: def.file.clone(),
                            line: *line,
                            message: "a form starts with a promise or join head".to_string(),
                        })
                    },
                };
                if head == "join" {
                    let mut parts = Vec::with_capacity(items.len() - 1);
                    for item in &items[1..] {
                        match self.build_item(def, item)? {
                            Item::Arg(arg) => parts.push(arg),
                            Item::Child(_) => {
                                return Err(ParseError::Syntax {
                                    file: def.file.clone(),
                                    line: *line,
                                    message: "(join) takes only arguments".to_string(),
                                })
                            },
                        }
                    }
                    return Ok(Item::Arg(Argument::Join(parts)));
                }
                Ok(Item::Child(self.build_form(def, &head, &items[1..], *line)?))
            },
        }
    }

    fn build_form(
        &mut self,
        def: &Definition,
        head: &str,
        rest: &[Node],
        line: usize,
    ) -> Result<Promise, ParseError> {
        let mut children = Vec::new();
        let mut args = Vec::new();
        for item in rest {
            match self.build_item(def, item)? {
                Item::Child(p) => children.push(p),
                Item::Arg(a) => args.push(a),
            }
        }

        if let Some(builtin) = Builtin::from_head(head) {
            return Promise::construct(builtin, children, args).map_err(|source| {
                ParseError::Construct {
                    file: def.file.clone(),
                    line,
                    source,
                }
            });
        }

        // A non-builtin head is a reference to a named promise; only
        // arguments are allowed at the call site.
        if !children.is_empty() {
            return Err(ParseError::Syntax {
                file: def.file.clone(),
                line,
                message: format!("({head}) call sites take only arguments"),
            });
        }
        let body = self.body_of(head, &def.file, line)?;
        Ok(Promise::Named {
            name: head.to_string(),
            body: Box::new(body),
            args,
        })
    }

    fn build_bracket(
        &self,
        def: &Definition,
        content: &str,
        line: usize,
    ) -> Result<Argument, ParseError> {
        let (prefix, rest) = content.split_once(':').ok_or_else(|| ParseError::Syntax {
            file: def.file.clone(),
            line,
            message: format!("malformed bracket atom [{content}]"),
        })?;
        match prefix {
            "var" => Ok(Argument::VarRef(rest.to_string())),
            "env" => Ok(Argument::EnvRef(rest.to_string())),
            "arg" => {
                let position = rest.parse::<usize>().map_err(|_| ParseError::Syntax {
                    file: def.file.clone(),
                    line,
                    message: format!("[arg:N] needs a numeric position, got [{content}]"),
                })?;
                Ok(Argument::ArgRef(position))
            },
            _ => Err(ParseError::Syntax {
                file: def.file.clone(),
                line,
                message: format!("unknown bracket atom [{content}]"),
            }),
        }
    }
}

enum Item {
    Child(Promise),
    Arg(Argument),
}

/// Tokenize and parse one source file into its top-level forms.
fn read_forms(source: &Source) -> Result<Vec<Node>, ParseError> {
    let tokens = lex(source)?;
    let mut forms = Vec::new();
    let mut cursor = 0;
    while cursor < tokens.len() {
        let (node, next) = parse_node(source, &tokens, cursor)?;
        if !matches!(node, Node::List { .. }) {
            return Err(syntax(
                source,
                tokens[cursor].line,
                "only definition lists are allowed at the top level",
            ));
        }
        forms.push(node);
        cursor = next;
    }
    Ok(forms)
}

#[derive(Debug)]
struct Token {
    kind: TokenKind,
    line: usize,
}

#[derive(Debug)]
enum TokenKind {
    LParen,
    RParen,
    Str(String),
    Word(String),
    Bracket(String),
}

fn lex(source: &Source) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = source.text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {},
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            },
            '(' => tokens.push(Token {
                kind: TokenKind::LParen,
                line,
            }),
            ')' => tokens.push(Token {
                kind: TokenKind::RParen,
                line,
            }),
            '"' => {
                let start = line;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => {
                                return Err(syntax(source, start, "unterminated string literal"))
                            },
                        },
                        Some('\n') => {
                            line += 1;
                            value.push('\n');
                        },
                        Some(other) => value.push(other),
                        None => return Err(syntax(source, start, "unterminated string literal")),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    line: start,
                });
            },
            '[' => {
                let start = line;
                let mut content = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some('\n') | None => {
                            return Err(syntax(source, start, "unterminated bracket atom"))
                        },
                        Some(other) => content.push(other),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Bracket(content),
                    line: start,
                });
            },
            other => {
                let mut word = String::from(other);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | '"' | '[' | '#') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Word(word),
                    line,
                });
            },
        }
    }
    Ok(tokens)
}

fn parse_node(
    source: &Source,
    tokens: &[Token],
    cursor: usize,
) -> Result<(Node, usize), ParseError> {
    let token = tokens
        .get(cursor)
        .ok_or_else(|| syntax(source, 0, "unexpected end of input"))?;
    match &token.kind {
        TokenKind::Str(s) => Ok((Node::Str(s.clone()), cursor + 1)),
        TokenKind::Word(w) => Ok((Node::Word(w.clone()), cursor + 1)),
        TokenKind::Bracket(content) => Ok((
            Node::Bracket {
                content: content.clone(),
                line: token.line,
            },
            cursor + 1,
        )),
        TokenKind::RParen => Err(syntax(source, token.line, "unexpected ')'")),
        TokenKind::LParen => {
            let line = token.line;
            let mut items = Vec::new();
            let mut cursor = cursor + 1;
            loop {
                match tokens.get(cursor) {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => return Ok((Node::List { items, line }, cursor + 1)),
                    Some(_) => {
                        let (node, next) = parse_node(source, tokens, cursor)?;
                        items.push(node);
                        cursor = next;
                    },
                    None => return Err(syntax(source, line, "unclosed '('")),
                }
            }
        },
    }
}
