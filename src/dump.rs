/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Parser for the thread stack dump format produced by the capture layer
//! (see [`crate::capture`] for the format definition).
//!
//! Parsing borrows from the raw buffer; nothing is allocated per frame. A
//! malformed dump is a tick fault and surfaces as an error.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

/// One thread's block of a dump.
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadDump<'a> {
    pub thread_id: u64,
    pub name: &'a str,
    /// Most recent call first.
    pub frames: Vec<RawFrame<'a>>,
}

/// One unresolved frame line pair.
#[derive(Debug, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub function: &'a str,
    pub abs_path: &'a str,
    pub lineno: u32,
}

/// Parse a complete dump into per-thread frame lists.
pub fn parse(text: &str) -> Result<Vec<ThreadDump<'_>>> {
    let mut dumps = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }
        let rest = line
            .strip_prefix("thread ")
            .with_context(|| format!("expected thread header, got {line:?}"))?;
        let (tid, name) = rest
            .split_once(' ')
            .with_context(|| format!("malformed thread header {line:?}"))?;
        let thread_id = tid
            .parse::<u64>()
            .with_context(|| format!("bad thread id in header {line:?}"))?;
        if name.is_empty() {
            bail!("empty thread name in header {line:?}");
        }

        let mut frames = Vec::new();
        while let Some(&next) = lines.peek() {
            if next.is_empty() {
                break;
            }
            let function = lines.next().unwrap_or_default();
            let location = lines
                .next()
                .with_context(|| format!("missing location line after {function:?}"))?;
            let location = location
                .strip_prefix("\tat ")
                .with_context(|| format!("malformed location line {location:?}"))?;
            let (abs_path, lineno) = location
                .rsplit_once(':')
                .with_context(|| format!("missing line number in {location:?}"))?;
            let lineno = lineno
                .parse::<u32>()
                .with_context(|| format!("bad line number in {location:?}"))?;
            frames.push(RawFrame {
                function,
                abs_path,
                lineno,
            });
        }

        dumps.push(ThreadDump {
            thread_id,
            name,
            frames,
        });
    }

    Ok(dumps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
thread 11 main
app::work
\tat /src/app.rs:10
app::main
\tat /src/app.rs:3

thread 12 io worker
app::io::poll
\tat /src/app/io.rs:55
";

    #[test]
    fn parses_two_threads() {
        let dumps = parse(DUMP).unwrap();
        assert_eq!(dumps.len(), 2);

        assert_eq!(dumps[0].thread_id, 11);
        assert_eq!(dumps[0].name, "main");
        assert_eq!(
            dumps[0].frames,
            vec![
                RawFrame {
                    function: "app::work",
                    abs_path: "/src/app.rs",
                    lineno: 10,
                },
                RawFrame {
                    function: "app::main",
                    abs_path: "/src/app.rs",
                    lineno: 3,
                },
            ]
        );

        // Thread names may contain spaces.
        assert_eq!(dumps[1].thread_id, 12);
        assert_eq!(dumps[1].name, "io worker");
        assert_eq!(dumps[1].frames.len(), 1);
    }

    #[test]
    fn empty_dump_is_no_threads() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("goroutine 1 [running]:").is_err());
        assert!(parse("thread abc main\n").is_err());
        assert!(parse("thread 1 main\napp::work\n").is_err());
        assert!(parse("thread 1 main\napp::work\n\tat nowhere\n").is_err());
    }
}
