//! Recursive promise evaluation.
//!
//! Evaluation returns `Result<bool, EvalFatal>`: the boolean is the regular
//! outcome of tests and combinators, while [`EvalFatal`] carries the
//! non-recoverable structural and resolution failures that abort the whole
//! run at the driver boundary. There is no panic-based control flow.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::args::Argument;
use super::exec::eval_pipe;
use super::{LogLevel, Promise};
use crate::context::{Context, Credential};
use crate::text::format_positional;

/// Classification of a fatal evaluation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Ill-formed promise detected at binding time.
    Structural,
    /// A name, path, user or variable could not be resolved.
    Resolution,
}

/// A non-recoverable evaluation failure. Unwinds to the driver boundary,
/// where the run is marked failed with the message preserved.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EvalFatal {
    pub kind: FatalKind,
    pub message: String,
}

impl EvalFatal {
    /// A structural failure: the promise shape is ill-formed for its
    /// binding site.
    pub fn structural(message: impl Into<String>) -> Self {
        Self {
            kind: FatalKind::Structural,
            message: message.into(),
        }
    }

    /// A resolution failure: a name, path, user or variable could not be
    /// resolved.
    pub fn resolution(message: impl Into<String>) -> Self {
        Self {
            kind: FatalKind::Resolution,
            message: message.into(),
        }
    }
}

/// Outcome of evaluating one promise node.
pub type EvalResult = Result<bool, EvalFatal>;

impl Promise {
    /// Evaluate this node against a call frame, a context and the current
    /// stack-trace string.
    ///
    /// # Errors
    ///
    /// Returns [`EvalFatal`] for structural and resolution failures; all
    /// recoverable failures (non-zero exits, false branches) are `Ok(false)`.
    pub fn eval(&self, frame: &[String], ctx: &mut Context, stack: &str) -> EvalResult {
        match self {
            Self::Named { name, body, args } => {
                let actuals: Vec<String> =
                    args.iter().map(|a| a.value(frame, &ctx.vars)).collect();
                // Fresh clone of the variable map so callee bindings do not
                // leak into the caller's scope.
                let mut scoped = ctx.clone();
                body.eval(&actuals, &mut scoped, &format!("{stack}->{name}"))
            },
            Self::And(children) => {
                for child in children {
                    if !child.eval(frame, ctx, stack)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
            Self::Or(children) => {
                for child in children {
                    if child.eval(frame, ctx, stack)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            },
            Self::Not(child) => Ok(!child.eval(frame, ctx, stack)?),
            Self::True(child) => {
                child.eval(frame, ctx, stack)?;
                Ok(true)
            },
            Self::False(child) => {
                child.eval(frame, ctx, stack)?;
                Ok(false)
            },
            Self::Exec(exec) => exec.eval(frame, ctx, stack),
            Self::Pipe(execs) => eval_pipe(execs, false, frame, ctx, stack),
            Self::SPipe(execs) => eval_pipe(execs, true, frame, ctx, stack),
            Self::InDir { dir, child } => {
                let raw = dir.value(frame, &ctx.vars);
                let mut scoped = ctx.clone();
                scoped.in_dir = Some(sanitize_in_dir(
                    &raw,
                    ctx.in_dir.as_deref(),
                    ctx.credential.as_ref(),
                )?);
                child.eval(frame, &mut scoped, stack)
            },
            Self::SetEnv { name, value, child } => {
                let name = name.value(frame, &ctx.vars);
                let value = value.value(frame, &ctx.vars);
                let mut scoped = ctx.clone();
                scoped.env.push((name, value));
                child.eval(frame, &mut scoped, stack)
            },
            Self::AsUser { user, child } => {
                let username = user.value(frame, &ctx.vars);
                let mut scoped = ctx.clone();
                scoped.credential = Some(lookup_user(&username)?);
                child.eval(frame, &mut scoped, stack)
            },
            Self::Readvar { name, child } => {
                let result = child.eval(frame, ctx, stack)?;
                let name = name.value(frame, &ctx.vars);
                let value = ctx.captured_stdout().trim().to_string();
                bind_var(ctx, &name, value)?;
                Ok(result)
            },
            Self::Setvar { name, value } => {
                let name = name.value(frame, &ctx.vars);
                let value = value.value(frame, &ctx.vars).trim().to_string();
                bind_var(ctx, &name, value)?;
                Ok(true)
            },
            Self::Log { level, args } => {
                let fmt = args[0].value(frame, &ctx.vars);
                let rest: Vec<String> =
                    args[1..].iter().map(|a| a.value(frame, &ctx.vars)).collect();
                let message = format_positional(&fmt, &rest);
                match level {
                    LogLevel::Info => ctx.reporter.info(&message),
                    LogLevel::Warning => ctx.reporter.warn(&message),
                    LogLevel::Error => ctx.reporter.error(&message),
                }
                Ok(true)
            },
            Self::Restart { new_exe } => eval_restart(new_exe.as_ref(), frame, ctx),
            Self::Eval { root, input_path } => eval_recursive(root, input_path, frame, ctx, stack),
            Self::Template {
                json,
                template_file,
                output,
            } => eval_template(json, template_file, output, frame, ctx),
        }
    }
}

/// Bind `name` to `value` in the current scope. Rebinding with an identical
/// value is a no-op; a different value is a resolution failure.
fn bind_var(ctx: &mut Context, name: &str, value: String) -> Result<(), EvalFatal> {
    match ctx.vars.get(name) {
        Some(existing) if *existing == value => Ok(()),
        Some(existing) => Err(EvalFatal::resolution(format!(
            "variable {name:?} is already bound to a different value ({existing:?})"
        ))),
        None => {
            ctx.vars.insert(name.to_string(), value);
            Ok(())
        },
    }
}

/// Normalize an in-dir argument: expand a leading `~/` against the
/// effective credential's home, join relative paths onto the enclosing
/// in-dir, canonicalize, and require an existing directory.
fn sanitize_in_dir(
    raw: &str,
    enclosing: Option<&Path>,
    credential: Option<&Credential>,
) -> Result<PathBuf, EvalFatal> {
    let joined = if let Some(rest) = raw.strip_prefix("~/") {
        home_dir(credential)?.join(rest)
    } else {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else if let Some(base) = enclosing {
            base.join(path)
        } else {
            std::env::current_dir()
                .map_err(|e| EvalFatal::resolution(format!("resolve working directory: {e}")))?
                .join(path)
        }
    };

    let canonical = joined
        .canonicalize()
        .map_err(|e| EvalFatal::resolution(format!("(indir) error for path {raw:?}: {e}")))?;
    if !canonical.is_dir() {
        return Err(EvalFatal::resolution(format!(
            "(indir) not a directory: {canonical:?}"
        )));
    }
    Ok(canonical)
}

fn home_dir(credential: Option<&Credential>) -> Result<PathBuf, EvalFatal> {
    if let Some(cred) = credential {
        return Ok(cred.home.clone());
    }
    let uid = nix::unistd::Uid::current();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.dir),
        Ok(None) => Err(EvalFatal::resolution("current user is unknown")),
        Err(e) => Err(EvalFatal::resolution(format!("get current user: {e}"))),
    }
}

/// Resolve a user name to a credential once per evaluation; failures are
/// fatal for the node.
fn lookup_user(username: &str) -> Result<Credential, EvalFatal> {
    match nix::unistd::User::from_name(username) {
        Ok(Some(user)) => Ok(Credential {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }),
        Ok(None) => Err(EvalFatal::resolution(format!(
            "lookup user {username:?}: unknown user"
        ))),
        Err(e) => Err(EvalFatal::resolution(format!(
            "lookup user {username:?}: {e}"
        ))),
    }
}

/// Optionally replace the running executable, then raise SIGUSR2 against
/// this process to trigger the live-upgrade path. Returns true; the old
/// server does not outlive the upgrade.
fn eval_restart(new_exe: Option<&Argument>, frame: &[String], ctx: &mut Context) -> EvalResult {
    if let Some(arg) = new_exe {
        let replacement = arg.value(frame, &ctx.vars);
        if !Path::new(&replacement).exists() {
            ctx.reporter
                .error(&format!("(restart) replacement {replacement:?} does not exist"));
            return Ok(false);
        }
        let executable = ctx
            .vars
            .get("executable")
            .cloned()
            .ok_or_else(|| EvalFatal::resolution("(restart) executable path is not defined"))?;
        std::fs::rename(&replacement, &executable)
            .map_err(|e| EvalFatal::resolution(format!("(restart) replace executable: {e}")))?;
        ctx.reporter.info(&format!(
            "replaced executable, restarting: {executable} {:?}",
            ctx.proc_args
        ));
    }

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR2)
        .map_err(|e| EvalFatal::resolution(format!("(restart) raise SIGUSR2: {e}")))?;
    Ok(true)
}

/// Recursively compile `input_path` against the library dir and evaluate
/// the requested root promise in a scoped context.
fn eval_recursive(
    root: &Argument,
    input_path: &Argument,
    frame: &[String],
    ctx: &mut Context,
    stack: &str,
) -> EvalResult {
    let root = root.value(frame, &ctx.vars);
    let input = input_path.value(frame, &ctx.vars);

    if root.is_empty() {
        return Err(EvalFatal::resolution("(eval) root promise is undefined"));
    }
    let input = PathBuf::from(&input);
    if !input.exists() {
        return Err(EvalFatal::resolution(format!(
            "(eval) input path {input:?} does not exist"
        )));
    }

    let lib_dir = ctx
        .vars
        .get("lib_dir")
        .cloned()
        .ok_or_else(|| EvalFatal::resolution("(eval) library dir is not defined"))?;
    let lib_dir = PathBuf::from(lib_dir);
    if !lib_dir.exists() {
        return Err(EvalFatal::resolution(format!(
            "(eval) library dir {lib_dir:?} is not present"
        )));
    }

    let promises = ctx
        .compiler
        .compile(&[lib_dir, input.clone()])
        .map_err(|e| EvalFatal::resolution(format!("(eval) compile promise: {e}")))?;
    let tree = promises
        .get(&root)
        .ok_or_else(|| EvalFatal::resolution(format!("root promise ({root}) unknown")))?;

    let mut scoped = ctx.clone();
    scoped.in_dir = Some(input);
    tree.eval(&[], &mut scoped, stack)
}

/// Render a text template against JSON data into an output file. Single
/// quotes in the JSON argument are translated to double quotes before
/// decoding, a quoting convenience promise sources rely on. IO and parse
/// failures are recoverable: reported and mapped to false.
fn eval_template(
    json: &Argument,
    template_file: &Argument,
    output: &Argument,
    frame: &[String],
    ctx: &mut Context,
) -> EvalResult {
    let json_raw = json.value(frame, &ctx.vars).replace('\'', "\"");
    let template_path = template_file.value(frame, &ctx.vars);
    let output_path = output.value(frame, &ctx.vars);

    let data: serde_json::Value = match serde_json::from_str(&json_raw) {
        Ok(value) => value,
        Err(e) => {
            ctx.reporter.error(&format!("(template) decode data: {e}"));
            return Ok(false);
        },
    };

    let source = match std::fs::read_to_string(&template_path) {
        Ok(source) => source,
        Err(e) => {
            ctx.reporter
                .error(&format!("(template) read {template_path:?}: {e}"));
            return Ok(false);
        },
    };

    let mut env = minijinja::Environment::new();
    if let Err(e) = env.add_template("output", &source) {
        ctx.reporter.error(&format!("(template) parse: {e}"));
        return Ok(false);
    }
    let rendered = match env.get_template("output").and_then(|t| t.render(&data)) {
        Ok(rendered) => rendered,
        Err(e) => {
            ctx.reporter.error(&format!("(template) render: {e}"));
            return Ok(false);
        },
    };

    if let Err(e) = std::fs::write(&output_path, rendered) {
        ctx.reporter
            .error(&format!("(template) write {output_path:?}: {e}"));
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::NoCompiler;
    use crate::promise::{Builtin, ExecKind, ExecPromise};
    use crate::report::Reporter;

    fn ctx() -> Context {
        Context::new(
            Arc::new(NoCompiler),
            Reporter::with_sink(Box::new(std::io::sink())),
        )
    }

    fn test_exec(path: &str) -> Promise {
        Promise::Exec(ExecPromise {
            kind: ExecKind::Test,
            args: vec![Argument::constant(path)],
        })
    }

    fn marker_change(path: &str) -> Promise {
        Promise::Exec(ExecPromise {
            kind: ExecKind::Change,
            args: vec![Argument::constant("/bin/touch"), Argument::constant(path)],
        })
    }

    #[test]
    fn and_short_circuits_on_false() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("must-not-exist");
        let tree = Promise::construct(
            Builtin::And,
            vec![
                test_exec("/bin/true"),
                test_exec("/bin/false"),
                marker_change(marker.to_str().unwrap()),
            ],
            vec![],
        )
        .unwrap();

        let mut ctx = ctx();
        assert!(!tree.eval(&[], &mut ctx, "").unwrap());
        assert!(!marker.exists(), "third child must not run");
        let counters = ctx.reporter.counters();
        assert_eq!(counters.tests, 2);
        assert_eq!(counters.changes, 0);
    }

    #[test]
    fn or_short_circuits_on_true() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("must-not-exist");
        let tree = Promise::construct(
            Builtin::Or,
            vec![test_exec("/bin/true"), marker_change(marker.to_str().unwrap())],
            vec![],
        )
        .unwrap();

        let mut ctx = ctx();
        assert!(tree.eval(&[], &mut ctx, "").unwrap());
        assert!(!marker.exists(), "second child must not run");
    }

    #[test]
    fn not_inverts() {
        let tree = Promise::Not(Box::new(test_exec("/bin/false")));
        assert!(tree.eval(&[], &mut ctx(), "").unwrap());
    }

    #[test]
    fn true_and_false_still_evaluate_child() {
        let mut c = ctx();
        let tree = Promise::True(Box::new(test_exec("/bin/false")));
        assert!(tree.eval(&[], &mut c, "").unwrap());
        assert_eq!(c.reporter.counters().tests, 1, "child side effects happen");

        let tree = Promise::False(Box::new(test_exec("/bin/true")));
        assert!(!tree.eval(&[], &mut c, "").unwrap());
    }

    #[test]
    fn named_substitutes_positional_arguments() {
        // (greet [arg:0]) where the body echoes its first formal.
        let body = Promise::Exec(ExecPromise {
            kind: ExecKind::Test,
            args: vec![
                Argument::constant("/bin/echo"),
                Argument::ArgRef(0),
            ],
        });
        let call = Promise::Named {
            name: "greet".to_string(),
            body: Box::new(body),
            args: vec![Argument::constant("world")],
        };

        let mut c = ctx();
        assert!(call.eval(&[], &mut c, "").unwrap());
        assert_eq!(c.captured_stdout().trim(), "world");
    }

    #[test]
    fn named_does_not_leak_bindings_to_caller() {
        let body = Promise::Setvar {
            name: Argument::constant("inner"),
            value: Argument::constant("1"),
        };
        let call = Promise::Named {
            name: "binds".to_string(),
            body: Box::new(body),
            args: vec![],
        };

        let mut c = ctx();
        assert!(call.eval(&[], &mut c, "").unwrap());
        assert!(!c.vars.contains_key("inner"));
    }

    #[test]
    fn setvar_rejects_rebinding_with_different_value() {
        let mut c = ctx();
        let first = Promise::Setvar {
            name: Argument::constant("v"),
            value: Argument::constant("one"),
        };
        assert!(first.eval(&[], &mut c, "").unwrap());
        // Identical rebinding is idempotent.
        assert!(first.eval(&[], &mut c, "").unwrap());

        let second = Promise::Setvar {
            name: Argument::constant("v"),
            value: Argument::constant("two"),
        };
        let err = second.eval(&[], &mut c, "").unwrap_err();
        assert_eq!(err.kind, FatalKind::Resolution);
    }

    #[test]
    fn readvar_binds_trimmed_stdout() {
        let mut c = ctx();
        let tree = Promise::Readvar {
            name: Argument::constant("greeting"),
            child: Box::new(Promise::Exec(ExecPromise {
                kind: ExecKind::Test,
                args: vec![Argument::constant("/bin/echo"), Argument::constant("  hi  ")],
            })),
        };
        assert!(tree.eval(&[], &mut c, "").unwrap());
        assert_eq!(c.vars.get("greeting").unwrap(), "hi");

        // Rebinding with the identical value is a no-op; a different
        // value is fatal.
        assert!(tree.eval(&[], &mut c, "").unwrap());
        let different = Promise::Readvar {
            name: Argument::constant("greeting"),
            child: Box::new(Promise::Exec(ExecPromise {
                kind: ExecKind::Test,
                args: vec![Argument::constant("/bin/echo"), Argument::constant("other")],
            })),
        };
        let err = different.eval(&[], &mut c, "").unwrap_err();
        assert_eq!(err.kind, FatalKind::Resolution);
    }

    #[test]
    fn indir_scopes_are_hygienic() {
        let mut c = ctx();
        let tree = Promise::InDir {
            dir: Argument::constant("/tmp"),
            child: Box::new(Promise::Setvar {
                name: Argument::constant("inside"),
                value: Argument::constant("1"),
            }),
        };
        assert!(tree.eval(&[], &mut c, "").unwrap());
        assert!(c.in_dir.is_none(), "parent in_dir unchanged");
        assert!(!c.vars.contains_key("inside"), "child bindings stay scoped");
    }

    #[test]
    fn indir_rejects_missing_directory() {
        let mut c = ctx();
        let tree = Promise::InDir {
            dir: Argument::constant("/no/such/dir-42"),
            child: Box::new(test_exec("/bin/true")),
        };
        let err = tree.eval(&[], &mut c, "").unwrap_err();
        assert_eq!(err.kind, FatalKind::Resolution);
    }

    #[test]
    fn indir_rejects_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut c = ctx();
        let tree = Promise::InDir {
            dir: Argument::constant(file.path().to_str().unwrap()),
            child: Box::new(test_exec("/bin/true")),
        };
        assert!(tree.eval(&[], &mut c, "").is_err());
    }

    #[test]
    fn relative_indir_joins_enclosing_scope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let inner = Promise::InDir {
            dir: Argument::constant("nested"),
            child: Box::new(Promise::Exec(ExecPromise {
                kind: ExecKind::Test,
                args: vec![Argument::constant("/bin/sh"), Argument::constant("-c"), Argument::constant("pwd")],
            })),
        };
        let tree = Promise::InDir {
            dir: Argument::constant(dir.path().to_str().unwrap()),
            child: Box::new(inner),
        };

        let mut c = ctx();
        assert!(tree.eval(&[], &mut c, "").unwrap());
        let pwd = c.captured_stdout();
        assert!(pwd.trim().ends_with("nested"), "got {pwd}");
    }

    #[test]
    fn setenv_is_visible_to_child_and_scoped() {
        let mut c = ctx();
        let tree = Promise::SetEnv {
            name: Argument::constant("PLEDGE_SCOPED"),
            value: Argument::constant("yes"),
            child: Box::new(Promise::Exec(ExecPromise {
                kind: ExecKind::Test,
                args: vec![
                    Argument::constant("/bin/sh"),
                    Argument::constant("-c"),
                    Argument::constant("printf %s \"$PLEDGE_SCOPED\""),
                ],
            })),
        };
        assert!(tree.eval(&[], &mut c, "").unwrap());
        assert_eq!(c.captured_stdout(), "yes");
        assert!(c.env.is_empty(), "parent env unchanged");
    }

    #[test]
    fn asuser_unknown_user_is_fatal() {
        let mut c = ctx();
        let tree = Promise::AsUser {
            user: Argument::constant("pledge-no-such-user-42"),
            child: Box::new(test_exec("/bin/true")),
        };
        let err = tree.eval(&[], &mut c, "").unwrap_err();
        assert_eq!(err.kind, FatalKind::Resolution);
    }

    #[test]
    fn log_promise_always_succeeds_and_formats() {
        let mut c = ctx();
        let tree = Promise::Log {
            level: LogLevel::Info,
            args: vec![
                Argument::constant("value is {}"),
                Argument::constant("42"),
            ],
        };
        assert!(tree.eval(&[], &mut c, "").unwrap());
    }

    #[test]
    fn eval_requires_lib_dir() {
        let mut c = ctx();
        let dir = tempfile::tempdir().unwrap();
        let tree = Promise::Eval {
            root: Argument::constant("done"),
            input_path: Argument::constant(dir.path().to_str().unwrap()),
        };
        let err = tree.eval(&[], &mut c, "").unwrap_err();
        assert!(err.message.contains("library dir"));
    }

    #[test]
    fn template_renders_json_data() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("motd.tmpl");
        let output = dir.path().join("motd");
        std::fs::write(&template, "hello {{ name }}").unwrap();

        let mut c = ctx();
        let tree = Promise::Template {
            json: Argument::constant("{'name': 'world'}"),
            template_file: Argument::constant(template.to_str().unwrap()),
            output: Argument::constant(output.to_str().unwrap()),
        };
        assert!(tree.eval(&[], &mut c, "").unwrap());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello world");
    }

    #[test]
    fn template_bad_json_is_recoverable() {
        let mut c = ctx();
        let tree = Promise::Template {
            json: Argument::constant("not json"),
            template_file: Argument::constant("/nonexistent"),
            output: Argument::constant("/nonexistent"),
        };
        assert!(!tree.eval(&[], &mut c, "").unwrap());
        assert_eq!(c.reporter.counters().errors, 1);
    }
}
