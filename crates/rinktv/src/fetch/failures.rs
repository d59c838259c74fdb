//! Failed downloads recovered from an aria2 log.
//!
//! aria2 reports a file it gave up on with an `[ERROR]` record such as
//!
//! ```text
//! 2019-10-08 20:02:51.347743 [ERROR] [AbstractCommand.cc:351] CUID#7 - Download aborted. URI=https://example.com/1.ts
//! Exception: [AbstractCommand.cc:351] errorCode=3 URI=https://example.com/1.ts
//!   -> [HttpSkipResponseCommand.cc:218] errorCode=3 Resource not found
//! ```
//!
//! Only the `[ERROR]` line itself is used. Continuation lines repeat the uri
//! and would double count it.

use std::collections::HashSet;

const ERROR_MARKER: &str = "[ERROR]";
const URI_MARKER: &str = "URI=";

/// The uri named by one log line, if it is an error record.
pub fn failed_uri(line: &str) -> Option<&str> {
    if !line.contains(ERROR_MARKER) {
        return None;
    }
    let start = line.find(URI_MARKER)? + URI_MARKER.len();
    let uri = line[start..].split_whitespace().next()?;
    Some(uri)
}

/// Distinct failed uris in the order they first appear.
pub fn parse_failed_uris(log: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    log.lines()
        .filter_map(failed_uri)
        .filter(|uri| seen.insert(*uri))
        .map(str::to_string)
        .collect()
}

/// Whether a line of aria2 console output announces a finished segment.
pub fn is_segment_complete(line: &str, extension: &str) -> bool {
    line.contains("Download complete")
        && line
            .trim_end()
            .strip_suffix(extension)
            .is_some_and(|rest| rest.ends_with('.'))
}
