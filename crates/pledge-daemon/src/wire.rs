//! Tag-discriminated binary encoding of the promise algebra.
//!
//! Every promise and argument variant carries a stable one-byte tag;
//! serialization writes `tag || payload` and deserialization dispatches on
//! the tag. The variant set is a compile-time enumeration - there is no
//! dynamic type registration, and an unknown tag is a decode error.
//!
//! Primitives: strings are a u32 length prefix plus UTF-8 bytes, sequences
//! a u32 count plus items. Decoding is bounded: lengths are checked against
//! the remaining input before allocation and nesting is capped at
//! [`MAX_DEPTH`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pledge_core::{Argument, ExecKind, ExecPromise, LogLevel, Promise};
use thiserror::Error;

/// Maximum nesting depth accepted while decoding a tree.
pub const MAX_DEPTH: usize = 512;

/// Decode failure of a wire-encoded tree.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("input truncated while decoding {0}")]
    Truncated(&'static str),

    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("tree nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("{0} trailing bytes after the tree")]
    TrailingBytes(usize),
}

// Promise tags.
const TAG_NAMED: u8 = 1;
const TAG_AND: u8 = 2;
const TAG_OR: u8 = 3;
const TAG_NOT: u8 = 4;
const TAG_TRUE: u8 = 5;
const TAG_FALSE: u8 = 6;
const TAG_EXEC: u8 = 7;
const TAG_PIPE: u8 = 8;
const TAG_SPIPE: u8 = 9;
const TAG_INDIR: u8 = 10;
const TAG_SETENV: u8 = 11;
const TAG_ASUSER: u8 = 12;
const TAG_READVAR: u8 = 13;
const TAG_SETVAR: u8 = 14;
const TAG_LOG: u8 = 15;
const TAG_RESTART: u8 = 16;
const TAG_EVAL: u8 = 17;
const TAG_TEMPLATE: u8 = 18;

// Argument tags.
const ARG_CONSTANT: u8 = 1;
const ARG_ARGREF: u8 = 2;
const ARG_VARREF: u8 = 3;
const ARG_ENVREF: u8 = 4;
const ARG_JOIN: u8 = 5;

/// Encode a promise tree into its wire form.
#[must_use]
pub fn encode_promise(tree: &Promise) -> Bytes {
    let mut buf = BytesMut::new();
    write_promise(&mut buf, tree);
    buf.freeze()
}

/// Decode a promise tree, requiring the input to be fully consumed.
///
/// # Errors
///
/// Returns a [`WireError`] on truncation, unknown tags, invalid UTF-8,
/// excessive nesting or trailing bytes.
pub fn decode_promise(mut input: Bytes) -> Result<Promise, WireError> {
    let tree = read_promise(&mut input, 0)?;
    if input.has_remaining() {
        return Err(WireError::TrailingBytes(input.remaining()));
    }
    Ok(tree)
}

fn write_promise(buf: &mut BytesMut, tree: &Promise) {
    match tree {
        Promise::Named { name, body, args } => {
            buf.put_u8(TAG_NAMED);
            write_string(buf, name);
            write_promise(buf, body);
            write_args(buf, args);
        },
        Promise::And(children) => {
            buf.put_u8(TAG_AND);
            write_promises(buf, children);
        },
        Promise::Or(children) => {
            buf.put_u8(TAG_OR);
            write_promises(buf, children);
        },
        Promise::Not(child) => {
            buf.put_u8(TAG_NOT);
            write_promise(buf, child);
        },
        Promise::True(child) => {
            buf.put_u8(TAG_TRUE);
            write_promise(buf, child);
        },
        Promise::False(child) => {
            buf.put_u8(TAG_FALSE);
            write_promise(buf, child);
        },
        Promise::Exec(exec) => {
            buf.put_u8(TAG_EXEC);
            write_exec(buf, exec);
        },
        Promise::Pipe(execs) => {
            buf.put_u8(TAG_PIPE);
            write_execs(buf, execs);
        },
        Promise::SPipe(execs) => {
            buf.put_u8(TAG_SPIPE);
            write_execs(buf, execs);
        },
        Promise::InDir { dir, child } => {
            buf.put_u8(TAG_INDIR);
            write_arg(buf, dir);
            write_promise(buf, child);
        },
        Promise::SetEnv { name, value, child } => {
            buf.put_u8(TAG_SETENV);
            write_arg(buf, name);
            write_arg(buf, value);
            write_promise(buf, child);
        },
        Promise::AsUser { user, child } => {
            buf.put_u8(TAG_ASUSER);
            write_arg(buf, user);
            write_promise(buf, child);
        },
        Promise::Readvar { name, child } => {
            buf.put_u8(TAG_READVAR);
            write_arg(buf, name);
            write_promise(buf, child);
        },
        Promise::Setvar { name, value } => {
            buf.put_u8(TAG_SETVAR);
            write_arg(buf, name);
            write_arg(buf, value);
        },
        Promise::Log { level, args } => {
            buf.put_u8(TAG_LOG);
            buf.put_u8(match level {
                LogLevel::Info => 0,
                LogLevel::Warning => 1,
                LogLevel::Error => 2,
            });
            write_args(buf, args);
        },
        Promise::Restart { new_exe } => {
            buf.put_u8(TAG_RESTART);
            match new_exe {
                Some(arg) => {
                    buf.put_u8(1);
                    write_arg(buf, arg);
                },
                None => buf.put_u8(0),
            }
        },
        Promise::Eval { root, input_path } => {
            buf.put_u8(TAG_EVAL);
            write_arg(buf, root);
            write_arg(buf, input_path);
        },
        Promise::Template {
            json,
            template_file,
            output,
        } => {
            buf.put_u8(TAG_TEMPLATE);
            write_arg(buf, json);
            write_arg(buf, template_file);
            write_arg(buf, output);
        },
    }
}

fn read_promise(input: &mut Bytes, depth: usize) -> Result<Promise, WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    let tag = read_u8(input, "promise tag")?;
    Ok(match tag {
        TAG_NAMED => Promise::Named {
            name: read_string(input)?,
            body: Box::new(read_promise(input, depth + 1)?),
            args: read_args(input, depth + 1)?,
        },
        TAG_AND => Promise::And(read_promises(input, depth + 1)?),
        TAG_OR => Promise::Or(read_promises(input, depth + 1)?),
        TAG_NOT => Promise::Not(Box::new(read_promise(input, depth + 1)?)),
        TAG_TRUE => Promise::True(Box::new(read_promise(input, depth + 1)?)),
        TAG_FALSE => Promise::False(Box::new(read_promise(input, depth + 1)?)),
        TAG_EXEC => Promise::Exec(read_exec(input, depth + 1)?),
        TAG_PIPE => Promise::Pipe(read_execs(input, depth + 1)?),
        TAG_SPIPE => Promise::SPipe(read_execs(input, depth + 1)?),
        TAG_INDIR => Promise::InDir {
            dir: read_arg(input, depth + 1)?,
            child: Box::new(read_promise(input, depth + 1)?),
        },
        TAG_SETENV => Promise::SetEnv {
            name: read_arg(input, depth + 1)?,
            value: read_arg(input, depth + 1)?,
            child: Box::new(read_promise(input, depth + 1)?),
        },
        TAG_ASUSER => Promise::AsUser {
            user: read_arg(input, depth + 1)?,
            child: Box::new(read_promise(input, depth + 1)?),
        },
        TAG_READVAR => Promise::Readvar {
            name: read_arg(input, depth + 1)?,
            child: Box::new(read_promise(input, depth + 1)?),
        },
        TAG_SETVAR => Promise::Setvar {
            name: read_arg(input, depth + 1)?,
            value: read_arg(input, depth + 1)?,
        },
        TAG_LOG => {
            let level = match read_u8(input, "log level")? {
                0 => LogLevel::Info,
                1 => LogLevel::Warning,
                2 => LogLevel::Error,
                tag => return Err(WireError::UnknownTag { what: "log level", tag }),
            };
            Promise::Log {
                level,
                args: read_args(input, depth + 1)?,
            }
        },
        TAG_RESTART => {
            let new_exe = match read_u8(input, "restart flag")? {
                0 => None,
                1 => Some(read_arg(input, depth + 1)?),
                tag => {
                    return Err(WireError::UnknownTag {
                        what: "restart flag",
                        tag,
                    })
                },
            };
            Promise::Restart { new_exe }
        },
        TAG_EVAL => Promise::Eval {
            root: read_arg(input, depth + 1)?,
            input_path: read_arg(input, depth + 1)?,
        },
        TAG_TEMPLATE => Promise::Template {
            json: read_arg(input, depth + 1)?,
            template_file: read_arg(input, depth + 1)?,
            output: read_arg(input, depth + 1)?,
        },
        tag => return Err(WireError::UnknownTag { what: "promise", tag }),
    })
}

fn write_exec(buf: &mut BytesMut, exec: &ExecPromise) {
    buf.put_u8(match exec.kind {
        ExecKind::Change => 0,
        ExecKind::Test => 1,
    });
    write_args(buf, &exec.args);
}

fn read_exec(input: &mut Bytes, depth: usize) -> Result<ExecPromise, WireError> {
    let kind = match read_u8(input, "exec kind")? {
        0 => ExecKind::Change,
        1 => ExecKind::Test,
        tag => return Err(WireError::UnknownTag { what: "exec kind", tag }),
    };
    Ok(ExecPromise {
        kind,
        args: read_args(input, depth)?,
    })
}

fn write_execs(buf: &mut BytesMut, execs: &[ExecPromise]) {
    write_len(buf, execs.len());
    for exec in execs {
        write_exec(buf, exec);
    }
}

fn read_execs(input: &mut Bytes, depth: usize) -> Result<Vec<ExecPromise>, WireError> {
    let count = read_len(input, "exec list")?;
    let mut execs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        execs.push(read_exec(input, depth)?);
    }
    Ok(execs)
}

fn write_promises(buf: &mut BytesMut, children: &[Promise]) {
    write_len(buf, children.len());
    for child in children {
        write_promise(buf, child);
    }
}

fn read_promises(input: &mut Bytes, depth: usize) -> Result<Vec<Promise>, WireError> {
    let count = read_len(input, "promise list")?;
    let mut children = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        children.push(read_promise(input, depth)?);
    }
    Ok(children)
}

fn write_arg(buf: &mut BytesMut, arg: &Argument) {
    match arg {
        Argument::Constant(s) => {
            buf.put_u8(ARG_CONSTANT);
            write_string(buf, s);
        },
        Argument::ArgRef(pos) => {
            buf.put_u8(ARG_ARGREF);
            #[allow(clippy::cast_possible_truncation)] // frame positions are tiny
            buf.put_u32(*pos as u32);
        },
        Argument::VarRef(name) => {
            buf.put_u8(ARG_VARREF);
            write_string(buf, name);
        },
        Argument::EnvRef(name) => {
            buf.put_u8(ARG_ENVREF);
            write_string(buf, name);
        },
        Argument::Join(parts) => {
            buf.put_u8(ARG_JOIN);
            write_args(buf, parts);
        },
    }
}

fn read_arg(input: &mut Bytes, depth: usize) -> Result<Argument, WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    let tag = read_u8(input, "argument tag")?;
    Ok(match tag {
        ARG_CONSTANT => Argument::Constant(read_string(input)?),
        ARG_ARGREF => Argument::ArgRef(read_u32(input, "argument position")? as usize),
        ARG_VARREF => Argument::VarRef(read_string(input)?),
        ARG_ENVREF => Argument::EnvRef(read_string(input)?),
        ARG_JOIN => Argument::Join(read_args(input, depth + 1)?),
        tag => return Err(WireError::UnknownTag { what: "argument", tag }),
    })
}

fn write_args(buf: &mut BytesMut, args: &[Argument]) {
    write_len(buf, args.len());
    for arg in args {
        write_arg(buf, arg);
    }
}

fn read_args(input: &mut Bytes, depth: usize) -> Result<Vec<Argument>, WireError> {
    let count = read_len(input, "argument list")?;
    let mut args = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        args.push(read_arg(input, depth)?);
    }
    Ok(args)
}

fn write_string(buf: &mut BytesMut, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(input: &mut Bytes) -> Result<String, WireError> {
    let len = read_len(input, "string")?;
    if input.remaining() < len {
        return Err(WireError::Truncated("string"));
    }
    let raw = input.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn write_len(buf: &mut BytesMut, len: usize) {
    #[allow(clippy::cast_possible_truncation)] // frames are capped well below u32::MAX
    buf.put_u32(len as u32);
}

fn read_len(input: &mut Bytes, what: &'static str) -> Result<usize, WireError> {
    Ok(read_u32(input, what)? as usize)
}

fn read_u32(input: &mut Bytes, what: &'static str) -> Result<u32, WireError> {
    if input.remaining() < 4 {
        return Err(WireError::Truncated(what));
    }
    Ok(input.get_u32())
}

fn read_u8(input: &mut Bytes, what: &'static str) -> Result<u8, WireError> {
    if !input.has_remaining() {
        return Err(WireError::Truncated(what));
    }
    Ok(input.get_u8())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn exec(kind: ExecKind, argv: &[&str]) -> ExecPromise {
        ExecPromise {
            kind,
            args: argv.iter().map(|a| Argument::constant(*a)).collect(),
        }
    }

    fn sample_tree() -> Promise {
        Promise::Named {
            name: "done".to_string(),
            body: Box::new(Promise::And(vec![
                Promise::Exec(exec(ExecKind::Test, &["/bin/true"])),
                Promise::InDir {
                    dir: Argument::constant("/tmp"),
                    child: Box::new(Promise::Pipe(vec![
                        exec(ExecKind::Test, &["/bin/echo", "hello"]),
                        exec(ExecKind::Change, &["/usr/bin/tee", "out"]),
                    ])),
                },
                Promise::Readvar {
                    name: Argument::constant("u"),
                    child: Box::new(Promise::Exec(exec(ExecKind::Test, &["/usr/bin/id", "-un"]))),
                },
                Promise::Log {
                    level: LogLevel::Warning,
                    args: vec![
                        Argument::constant("user {}"),
                        Argument::VarRef("u".to_string()),
                        Argument::Join(vec![Argument::ArgRef(0), Argument::EnvRef("HOME".into())]),
                    ],
                },
                Promise::Restart { new_exe: None },
            ])),
            args: vec![Argument::constant("x")],
        }
    }

    #[test]
    fn roundtrips_a_representative_tree() {
        let tree = sample_tree();
        let decoded = decode_promise(encode_promise(&tree)).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn unknown_promise_tag_fails() {
        let mut buf = BytesMut::new();
        buf.put_u8(200);
        assert_eq!(
            decode_promise(buf.freeze()),
            Err(WireError::UnknownTag {
                what: "promise",
                tag: 200
            })
        );
    }

    #[test]
    fn truncated_input_fails() {
        let encoded = encode_promise(&sample_tree());
        for cut in [0, 1, encoded.len() / 2, encoded.len() - 1] {
            let truncated = encoded.slice(..cut);
            assert!(decode_promise(truncated).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut encoded = BytesMut::from(&encode_promise(&sample_tree())[..]);
        encoded.put_u8(0);
        assert!(matches!(
            decode_promise(encoded.freeze()),
            Err(WireError::TrailingBytes(1))
        ));
    }

    #[test]
    fn forged_string_length_is_a_truncation_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(1); // Named
        buf.put_u32(u32::MAX); // claimed name length
        assert_eq!(
            decode_promise(buf.freeze()),
            Err(WireError::Truncated("string"))
        );
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut tree = Promise::Exec(exec(ExecKind::Test, &["/bin/true"]));
        for _ in 0..(MAX_DEPTH + 8) {
            tree = Promise::Not(Box::new(tree));
        }
        let encoded = encode_promise(&tree);
        assert_eq!(decode_promise(encoded), Err(WireError::TooDeep));
    }

    // Strategy for arbitrary arguments, bounded in depth and width.
    fn arb_argument() -> impl Strategy<Value = Argument> {
        let leaf = prop_oneof![
            "[a-z0-9/ .-]{0,24}".prop_map(Argument::Constant),
            (0usize..8).prop_map(Argument::ArgRef),
            "[a-z_]{1,12}".prop_map(Argument::VarRef),
            "[A-Z_]{1,12}".prop_map(Argument::EnvRef),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Argument::Join)
        })
    }

    fn arb_exec() -> impl Strategy<Value = ExecPromise> {
        (
            prop_oneof![Just(ExecKind::Change), Just(ExecKind::Test)],
            prop::collection::vec(arb_argument(), 1..4),
        )
            .prop_map(|(kind, args)| ExecPromise { kind, args })
    }

    fn arb_promise() -> impl Strategy<Value = Promise> {
        let leaf = prop_oneof![
            arb_exec().prop_map(Promise::Exec),
            prop::collection::vec(arb_exec(), 2..4).prop_map(Promise::Pipe),
            prop::collection::vec(arb_exec(), 2..4).prop_map(Promise::SPipe),
            (arb_argument(), arb_argument())
                .prop_map(|(name, value)| Promise::Setvar { name, value }),
            prop::collection::vec(arb_argument(), 1..4)
                .prop_map(|args| Promise::Log { level: LogLevel::Info, args }),
            prop::option::of(arb_argument()).prop_map(|new_exe| Promise::Restart { new_exe }),
        ];
        leaf.prop_recursive(4, 48, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 2..4).prop_map(Promise::And),
                prop::collection::vec(inner.clone(), 2..4).prop_map(Promise::Or),
                inner.clone().prop_map(|p| Promise::Not(Box::new(p))),
                (arb_argument(), inner.clone())
                    .prop_map(|(dir, p)| Promise::InDir { dir, child: Box::new(p) }),
                ("[a-z]{1,8}", inner, prop::collection::vec(arb_argument(), 0..3)).prop_map(
                    |(name, p, args)| Promise::Named {
                        name,
                        body: Box::new(p),
                        args,
                    }
                ),
            ]
        })
    }

    proptest! {
        #[test]
        fn roundtrips_arbitrary_trees(tree in arb_promise()) {
            let decoded = decode_promise(encode_promise(&tree)).unwrap();
            prop_assert_eq!(decoded, tree);
        }
    }
}
