//! Property tests over the construct-time arity table: for every builtin,
//! valid shapes construct and invalid shapes fail with a structural error.

use pledge_core::{Argument, Builtin, ExecKind, ExecPromise, Promise};
use proptest::prelude::*;

fn leaf() -> Promise {
    Promise::Exec(ExecPromise {
        kind: ExecKind::Test,
        args: vec![Argument::constant("/bin/true")],
    })
}

fn leaves(n: usize) -> Vec<Promise> {
    (0..n).map(|_| leaf()).collect()
}

fn constants(n: usize) -> Vec<Argument> {
    (0..n).map(|i| Argument::constant(format!("a{i}"))).collect()
}

/// (child-count range, arg-count range) accepted by each builtin; `None`
/// bounds are unbounded above.
fn arity(builtin: Builtin) -> ((usize, Option<usize>), (usize, Option<usize>)) {
    match builtin {
        Builtin::And | Builtin::Or => ((2, None), (0, Some(0))),
        Builtin::Not | Builtin::True | Builtin::False => ((1, Some(1)), (0, Some(0))),
        Builtin::Change | Builtin::Test => ((0, Some(0)), (1, None)),
        Builtin::Pipe | Builtin::SPipe => ((2, None), (0, Some(0))),
        Builtin::InDir | Builtin::AsUser | Builtin::Readvar => ((1, Some(1)), (1, Some(1))),
        Builtin::SetEnv => ((1, Some(1)), (2, Some(2))),
        Builtin::Setvar => ((0, Some(0)), (2, Some(2))),
        Builtin::Info | Builtin::Warning | Builtin::Error => ((0, Some(0)), (1, None)),
        Builtin::Restart => ((0, Some(0)), (0, Some(1))),
        Builtin::Eval => ((0, Some(0)), (2, Some(2))),
        Builtin::Template => ((0, Some(0)), (3, Some(3))),
    }
}

fn in_range(n: usize, (lo, hi): (usize, Option<usize>)) -> bool {
    n >= lo && hi.map_or(true, |hi| n <= hi)
}

const ALL: [Builtin; 20] = [
    Builtin::And,
    Builtin::Or,
    Builtin::Not,
    Builtin::True,
    Builtin::False,
    Builtin::Change,
    Builtin::Test,
    Builtin::Pipe,
    Builtin::SPipe,
    Builtin::InDir,
    Builtin::SetEnv,
    Builtin::AsUser,
    Builtin::Readvar,
    Builtin::Setvar,
    Builtin::Info,
    Builtin::Warning,
    Builtin::Error,
    Builtin::Restart,
    Builtin::Eval,
    Builtin::Template,
];

proptest! {
    /// Construction succeeds exactly when both counts fall inside the
    /// builtin's arity ranges (with exec-typed children, which every
    /// child-accepting builtin allows).
    #[test]
    fn construct_matches_arity_table(
        builtin_idx in 0usize..ALL.len(),
        n_children in 0usize..5,
        n_args in 0usize..5,
    ) {
        let builtin = ALL[builtin_idx];
        let (child_range, arg_range) = arity(builtin);
        let expect_ok = in_range(n_children, child_range) && in_range(n_args, arg_range);

        let result = Promise::construct(builtin, leaves(n_children), constants(n_args));
        prop_assert_eq!(
            result.is_ok(),
            expect_ok,
            "builtin {:?} with {} children / {} args -> {:?}",
            builtin,
            n_children,
            n_args,
            result.err()
        );
    }
}

#[test]
fn every_builtin_has_a_head() {
    for head in [
        "and", "or", "not", "true", "false", "change", "test", "pipe", "spipe", "indir",
        "setenv", "asuser", "readvar", "setvar", "info", "warning", "error", "restart", "eval",
        "template",
    ] {
        assert!(Builtin::from_head(head).is_some(), "missing head {head}");
    }
    assert!(Builtin::from_head("nope").is_none());
}
