//! Canned command responses for the fake shell
//!
//! The table is closed: nothing typed by a peer is ever executed, it only
//! selects one of a handful of scripted answers.

/// How a matched rule builds its answer.
#[derive(Debug, Clone, Copy)]
enum Reply {
    /// Fixed text, independent of the input.
    Literal(&'static str),
    /// `-bash: <input> not found`
    NotFound,
}

/// Rules in priority order. The first prefix that matches wins.
const RULES: &[(&str, Reply)] = &[
    ("ls", Reply::Literal("Desktop Documents Pictures Music Shared")),
    (
        "version",
        Reply::Literal(
            "GNU bash, version 3.1.27(1)-release (x86_64)\nCopyright (C) 2007 Free Software Foundation, Inc.",
        ),
    ),
    ("pwd", Reply::Literal("/home/user")),
    ("rm", Reply::NotFound),
];

/// Map a trimmed command line to the text the fake shell prints back.
pub fn respond(command: &str) -> String {
    for (prefix, reply) in RULES {
        if command.starts_with(prefix) {
            return match reply {
                Reply::Literal(text) => (*text).to_string(),
                Reply::NotFound => format!("-bash: {} not found", command),
            };
        }
    }
    format!("-bash: {} command not found", command)
}
