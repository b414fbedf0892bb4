//! The promise algebra.
//!
//! A promise tree describes idempotent actions (run a command, capture its
//! output, pipe commands, scope to a directory, switch credentials) and
//! tests (predicates over commands). Trees are built by the compiler from
//! `.cnf` sources, shipped over the wire, and walked by the evaluator.
//!
//! Every variant supports three operations: structural construction with
//! arity validation ([`Promise::construct`]), a human-readable description
//! ([`Promise::describe`]), and evaluation (`Promise::eval`).

mod args;
mod eval;
mod exec;

use std::fmt;

pub use args::{Argument, Variables, MISSING};
pub use eval::{EvalFatal, EvalResult, FatalKind};
pub use exec::ExecPromise;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two kinds of process-execution promise.
///
/// Changes are expected to mutate system state; tests only observe. The
/// distinction drives counter bookkeeping and the logging rule (change
/// output is always reported, test output only when verbose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecKind {
    /// An action that mutates the host.
    Change,
    /// A predicate over a command's exit status.
    Test,
}

impl ExecKind {
    /// The surface-syntax head for this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Severity of a log promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A node of the promise tree.
///
/// The set of variants is closed and each carries a stable wire tag in the
/// daemon's codec; extending the algebra means extending both.
#[derive(Debug, Clone, PartialEq)]
pub enum Promise {
    /// A callable definition. Evaluation pushes the name onto the stack
    /// trace, evaluates the call-site arguments against the *outer* frame,
    /// and descends into the body with a fresh clone of the variable map.
    Named {
        name: String,
        body: Box<Promise>,
        args: Vec<Argument>,
    },
    /// Short-circuiting conjunction; needs at least two children.
    And(Vec<Promise>),
    /// Short-circuiting disjunction; needs at least two children.
    Or(Vec<Promise>),
    /// Inverts its child's result.
    Not(Box<Promise>),
    /// Evaluates its child for side effects, then yields true.
    True(Box<Promise>),
    /// Evaluates its child for side effects, then yields false.
    False(Box<Promise>),
    /// Runs a subprocess; see [`ExecPromise`].
    Exec(ExecPromise),
    /// A sequence of execs wired stdout -> stdin; counters increment per
    /// child after successful start.
    Pipe(Vec<ExecPromise>),
    /// Like [`Promise::Pipe`] but pre-increments all child counters during
    /// command construction, regardless of outcome.
    SPipe(Vec<ExecPromise>),
    /// Evaluates the child with a mutated working directory.
    InDir { dir: Argument, child: Box<Promise> },
    /// Evaluates the child with `NAME=VALUE` appended to the environment.
    SetEnv {
        name: Argument,
        value: Argument,
        child: Box<Promise>,
    },
    /// Evaluates the child with the POSIX credential of the named user.
    AsUser { user: Argument, child: Box<Promise> },
    /// Evaluates the child, then binds the variable to its trimmed
    /// captured stdout.
    Readvar { name: Argument, child: Box<Promise> },
    /// Binds a variable to a literal value.
    Setvar { name: Argument, value: Argument },
    /// Emits a formatted message; always succeeds.
    Log { level: LogLevel, args: Vec<Argument> },
    /// Optionally replaces the running executable, then raises SIGUSR2 to
    /// trigger the live-upgrade path.
    Restart { new_exe: Option<Argument> },
    /// Recursively compiles an input path and evaluates a root promise
    /// from the result in a scoped context.
    Eval {
        root: Argument,
        input_path: Argument,
    },
    /// Renders a text template against JSON data into an output file.
    Template {
        json: Argument,
        template_file: Argument,
        output: Argument,
    },
}

/// Structural validation failure raised while constructing a promise node.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConstructError(pub String);

impl ConstructError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Surface-syntax heads of the constructible promise forms.
///
/// `Named` nodes are not constructible through this table; the compiler
/// builds them while resolving references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    And,
    Or,
    Not,
    True,
    False,
    Change,
    Test,
    Pipe,
    SPipe,
    InDir,
    SetEnv,
    AsUser,
    Readvar,
    Setvar,
    Info,
    Warning,
    Error,
    Restart,
    Eval,
    Template,
}

impl Builtin {
    /// Map a surface head to its builtin, if any.
    #[must_use]
    pub fn from_head(head: &str) -> Option<Self> {
        Some(match head {
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            "true" => Self::True,
            "false" => Self::False,
            "change" => Self::Change,
            "test" => Self::Test,
            "pipe" => Self::Pipe,
            "spipe" => Self::SPipe,
            "indir" => Self::InDir,
            "setenv" => Self::SetEnv,
            "asuser" => Self::AsUser,
            "readvar" => Self::Readvar,
            "setvar" => Self::Setvar,
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "restart" => Self::Restart,
            "eval" => Self::Eval,
            "template" => Self::Template,
            _ => return None,
        })
    }
}

impl Promise {
    /// Construct a promise node from a builtin head, validating child and
    /// argument arity.
    ///
    /// # Errors
    ///
    /// Returns a [`ConstructError`] when the shape does not match the
    /// variant's arity table.
    pub fn construct(
        head: Builtin,
        children: Vec<Promise>,
        args: Vec<Argument>,
    ) -> Result<Self, ConstructError> {
        match head {
            Builtin::And => {
                if children.len() < 2 {
                    return Err(ConstructError::new("(and) needs at least 2 nested promises"));
                }
                if !args.is_empty() {
                    return Err(ConstructError::new(
                        "string args are not allowed in (and) promises",
                    ));
                }
                Ok(Self::And(children))
            },
            Builtin::Or => {
                if children.len() < 2 {
                    return Err(ConstructError::new("(or) needs at least 2 nested promises"));
                }
                if !args.is_empty() {
                    return Err(ConstructError::new(
                        "string args are not allowed in (or) promises",
                    ));
                }
                Ok(Self::Or(children))
            },
            Builtin::Not | Builtin::True | Builtin::False => {
                let name = match head {
                    Builtin::Not => "not",
                    Builtin::True => "true",
                    _ => "false",
                };
                if children.len() != 1 {
                    return Err(ConstructError::new(format!(
                        "({name}) can only have one nested promise"
                    )));
                }
                if !args.is_empty() {
                    return Err(ConstructError::new(format!(
                        "string args are not allowed in ({name}) promises"
                    )));
                }
                let child = Box::new(children.into_iter().next().expect("checked above"));
                Ok(match head {
                    Builtin::Not => Self::Not(child),
                    Builtin::True => Self::True(child),
                    _ => Self::False(child),
                })
            },
            Builtin::Change | Builtin::Test => {
                let kind = if head == Builtin::Change {
                    ExecKind::Change
                } else {
                    ExecKind::Test
                };
                if !children.is_empty() {
                    return Err(ConstructError::new(format!(
                        "nested promises not allowed in ({kind})"
                    )));
                }
                if args.is_empty() {
                    return Err(ConstructError::new(format!(
                        "({kind}) needs at least 1 string argument"
                    )));
                }
                Ok(Self::Exec(ExecPromise { kind, args }))
            },
            Builtin::Pipe | Builtin::SPipe => {
                let name = if head == Builtin::Pipe { "pipe" } else { "spipe" };
                if !args.is_empty() {
                    return Err(ConstructError::new(format!(
                        "string arguments not allowed in ({name}) promise"
                    )));
                }
                let mut execs = Vec::with_capacity(children.len());
                for child in children {
                    match child {
                        Self::Exec(exec) => execs.push(exec),
                        _ => {
                            return Err(ConstructError::new(format!(
                                "only (test) or (change) promises allowed inside ({name}) promise"
                            )))
                        },
                    }
                }
                if execs.len() < 2 {
                    return Err(ConstructError::new(format!(
                        "({name}) needs at least 2 nested exec promises"
                    )));
                }
                Ok(if head == Builtin::Pipe {
                    Self::Pipe(execs)
                } else {
                    Self::SPipe(execs)
                })
            },
            Builtin::InDir => {
                let (arg, child) = one_child_one_arg("indir", children, args)?;
                Ok(Self::InDir {
                    dir: arg,
                    child: Box::new(child),
                })
            },
            Builtin::AsUser => {
                let (arg, child) = one_child_one_arg("asuser", children, args)?;
                Ok(Self::AsUser {
                    user: arg,
                    child: Box::new(child),
                })
            },
            Builtin::SetEnv => {
                if children.len() != 1 {
                    return Err(ConstructError::new(format!(
                        "(setenv) needs one promise, found {}",
                        children.len()
                    )));
                }
                if args.len() != 2 {
                    return Err(ConstructError::new(format!(
                        "(setenv) needs two arguments, found {}",
                        args.len()
                    )));
                }
                let mut args = args.into_iter();
                Ok(Self::SetEnv {
                    name: args.next().expect("checked above"),
                    value: args.next().expect("checked above"),
                    child: Box::new(children.into_iter().next().expect("checked above")),
                })
            },
            Builtin::Readvar => {
                if args.len() != 1 {
                    return Err(ConstructError::new("(readvar) needs exactly one variable name"));
                }
                if children.len() != 1 {
                    return Err(ConstructError::new("(readvar) needs exactly one exec promise"));
                }
                let child = children.into_iter().next().expect("checked above");
                match child {
                    Self::Exec(_) | Self::Pipe(_) | Self::Named { .. } => {},
                    _ => {
                        return Err(ConstructError::new(
                            "(readvar) did not find an evaluable promise",
                        ))
                    },
                }
                Ok(Self::Readvar {
                    name: args.into_iter().next().expect("checked above"),
                    child: Box::new(child),
                })
            },
            Builtin::Setvar => {
                if !children.is_empty() {
                    return Err(ConstructError::new("use (setvar \"varname\" \"varvalue\")"));
                }
                if args.len() != 2 {
                    return Err(ConstructError::new("use (setvar \"varname\" \"varvalue\")"));
                }
                let mut args = args.into_iter();
                Ok(Self::Setvar {
                    name: args.next().expect("checked above"),
                    value: args.next().expect("checked above"),
                })
            },
            Builtin::Info | Builtin::Warning | Builtin::Error => {
                if !children.is_empty() {
                    return Err(ConstructError::new(
                        "a (info|error|warning) promise cannot have nested promises",
                    ));
                }
                if args.is_empty() {
                    return Err(ConstructError::new(
                        "a (info|error|warning) promise needs at least one format string argument",
                    ));
                }
                let level = match head {
                    Builtin::Info => LogLevel::Info,
                    Builtin::Warning => LogLevel::Warning,
                    _ => LogLevel::Error,
                };
                Ok(Self::Log { level, args })
            },
            Builtin::Restart => {
                if !children.is_empty() {
                    return Err(ConstructError::new("(restart) cannot have nested promises"));
                }
                if args.len() > 1 {
                    return Err(ConstructError::new("(restart) takes at most 1 argument"));
                }
                Ok(Self::Restart {
                    new_exe: args.into_iter().next(),
                })
            },
            Builtin::Eval => {
                if !children.is_empty() {
                    return Err(ConstructError::new("(eval) allows no nested promises"));
                }
                if args.len() != 2 {
                    return Err(ConstructError::new("(eval) needs 2 parameters"));
                }
                let mut args = args.into_iter();
                Ok(Self::Eval {
                    root: args.next().expect("checked above"),
                    input_path: args.next().expect("checked above"),
                })
            },
            Builtin::Template => {
                if !children.is_empty() {
                    return Err(ConstructError::new("(template) allows no nested promises"));
                }
                if args.len() != 3 {
                    return Err(ConstructError::new("(template) needs 3 arguments"));
                }
                let mut args = args.into_iter();
                Ok(Self::Template {
                    json: args.next().expect("checked above"),
                    template_file: args.next().expect("checked above"),
                    output: args.next().expect("checked above"),
                })
            },
        }
    }

    /// Render a human-readable description of this node, used for logging
    /// and debug output.
    #[must_use]
    pub fn describe(&self, frame: &[String]) -> String {
        let vars = Variables::new();
        match self {
            Self::Named { name, body, args } => {
                let actuals: Vec<String> = args.iter().map(ToString::to_string).collect();
                format!("({name} {})", body.describe(&actuals))
            },
            Self::And(children) => describe_list("and", children, frame),
            Self::Or(children) => describe_list("or", children, frame),
            Self::Not(child) => format!("(not {})", child.describe(frame)),
            Self::True(child) => format!("(true {})", child.describe(frame)),
            Self::False(child) => format!("(false {})", child.describe(frame)),
            Self::Exec(exec) => exec.describe(frame),
            Self::Pipe(execs) => describe_execs("pipe", execs, frame),
            Self::SPipe(execs) => describe_execs("spipe", execs, frame),
            Self::InDir { dir, child } => {
                format!("(indir {dir} {})", child.describe(frame))
            },
            Self::SetEnv { name, child, .. } => {
                format!("(setenv {name} {})", child.describe(frame))
            },
            Self::AsUser { user, child } => {
                format!("(asuser {user} {})", child.describe(frame))
            },
            Self::Readvar { name, child } => {
                format!("(readvar {name} {})", child.describe(frame))
            },
            Self::Setvar { name, value } => format!("(setvar \"{name}\" \"{value}\")"),
            Self::Log { level, args } => {
                let rendered: Vec<String> =
                    args.iter().map(|a| a.value(frame, &vars)).collect();
                format!("({} {})", level.name(), rendered.join(" "))
            },
            Self::Restart { new_exe } => match new_exe {
                Some(arg) => format!("(restart {arg})"),
                None => "(restart)".to_string(),
            },
            Self::Eval { root, input_path } => {
                format!("(eval \"{root}\" \"{input_path}\")")
            },
            Self::Template {
                json,
                template_file,
                output,
            } => format!("(template in:{json} temp:{template_file} out:{output})"),
        }
    }
}

fn describe_list(name: &str, children: &[Promise], frame: &[String]) -> String {
    let mut out = format!("({name}");
    for child in children {
        out.push(' ');
        out.push_str(&child.describe(frame));
    }
    out.push(')');
    out
}

fn describe_execs(name: &str, execs: &[ExecPromise], frame: &[String]) -> String {
    let mut out = format!("({name}");
    for exec in execs {
        out.push(' ');
        out.push_str(&exec.describe(frame));
    }
    out.push(')');
    out
}

fn one_child_one_arg(
    name: &str,
    children: Vec<Promise>,
    args: Vec<Argument>,
) -> Result<(Argument, Promise), ConstructError> {
    if args.len() != 1 {
        return Err(ConstructError::new(format!(
            "({name}) needs exactly one argument, found {}",
            args.len()
        )));
    }
    if children.len() != 1 {
        return Err(ConstructError::new(format!(
            "({name}) needs exactly one child promise, found {}",
            children.len()
        )));
    }
    Ok((
        args.into_iter().next().expect("checked above"),
        children.into_iter().next().expect("checked above"),
    ))
}
