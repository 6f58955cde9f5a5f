/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Data model shared with the external transport collaborator.
//!
//! Everything here is plain data with `serde::Serialize` derives so the
//! surrounding SDK can encode an assembled [`Trace`] without reaching into
//! profiler internals.

use std::collections::HashMap;

use serde::Serialize;

/// A unique code location. Two captures of the same source line produce
/// equal frames and intern to the same index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Frame {
    /// Module path of the function (everything before the final `::`),
    /// empty for free-standing symbols like `main`.
    pub module: String,
    /// Unqualified function name.
    pub function: String,
    /// Absolute path of the source file, as reported by symbol resolution.
    pub abs_path: String,
    /// Base name of `abs_path`.
    pub filename: String,
    /// 1-based source line.
    pub lineno: u32,
}

impl Frame {
    /// Build a frame from the pieces found in a stack dump: a (possibly
    /// fully qualified, possibly hash-suffixed) symbol name, a source path
    /// and a line number.
    pub fn from_symbol(function: &str, abs_path: &str, lineno: u32) -> Self {
        let function = trim_hash_suffix(function);
        let (module, function) = match function.rsplit_once("::") {
            Some((module, name)) => (module.to_string(), name.to_string()),
            None => (String::new(), function.to_string()),
        };
        let filename = abs_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(abs_path)
            .to_string();
        Frame {
            module,
            function,
            abs_path: abs_path.to_string(),
            filename,
            lineno,
        }
    }
}

/// Drop the `::h0123456789abcdef` disambiguator the demangler leaves on
/// legacy Rust symbols.
fn trim_hash_suffix(symbol: &str) -> &str {
    if let Some((rest, last)) = symbol.rsplit_once("::") {
        if last.len() == 17
            && last.starts_with('h')
            && last[1..].bytes().all(|b| b.is_ascii_hexdigit())
        {
            return rest;
        }
    }
    symbol
}

/// One observation: a thread was executing a given call chain at a given
/// offset from the session start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub thread_id: u64,
    /// Index into [`Trace::stacks`].
    pub stack_id: u32,
    pub elapsed_since_start_ns: u64,
}

/// Display metadata for a thread ever observed during the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadMetadata {
    pub name: String,
}

/// Self-contained result of a time-range query, ready for external
/// reporting. Frame and stack tables are session-global, not filtered down
/// to the entries referenced by `samples`.
#[derive(Clone, Debug, Serialize)]
pub struct Trace {
    pub samples: Vec<Sample>,
    /// Each stack is an ordered list of frame indices, most recent call
    /// first.
    pub stacks: Vec<Vec<u32>>,
    pub frames: Vec<Frame>,
    pub thread_metadata: HashMap<u64, ThreadMetadata>,
}

/// A [`Trace`] plus the identity of the thread that started the session,
/// for correlation by the caller.
#[derive(Clone, Debug, Serialize)]
pub struct ProfileSlice {
    pub trace: Trace,
    pub caller_thread_id: u64,
}
