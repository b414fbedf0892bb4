//! pledge-core - promise algebra, evaluator and compiler.
//!
//! This crate contains the language-independent heart of pledge: the tagged
//! promise algebra with its argument expressions, the recursive evaluator
//! with scoped context mutations and process execution, the concurrent
//! promise compiler, and the evaluation reporter with its run-log sink.
//!
//! Transport and persistence live in `pledge-daemon`; the `pledge` binary
//! lives in `pledge-cli`.

pub mod compile;
pub mod context;
pub mod driver;
pub mod promise;
pub mod report;
pub mod runlog;
pub mod text;

pub use compile::{CnfParser, CompileError, Compiler, ParseError, Parser, PromiseSet, Source};
pub use context::{Capture, Context, Credential, NoCompiler, PromiseCompiler};
pub use driver::{Driver, DriverError, DriverSettings};
pub use promise::{
    Argument, Builtin, ConstructError, EvalFatal, ExecKind, ExecPromise, FatalKind, LogLevel,
    Promise, Variables,
};
pub use report::{Counters, Reporter};
pub use runlog::{RunLog, RunRecord};
