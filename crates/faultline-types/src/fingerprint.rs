//! Grouping fingerprint and the traceback text it is computed over.
//!
//! The fingerprint folds textually identical call stacks into one group
//! regardless of the per-incident message wording: the last two traceback
//! lines (the `Type: value` summary and the trailing blank) are dropped
//! before hashing, so only the stack above the message contributes.

use crate::Frame;

/// Header line of a rendered traceback.
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Compute the 128-bit grouping fingerprint as 32 lowercase hex chars.
///
/// `message` is only consulted when `traceback` is empty.
pub fn fingerprint(level: i64, class_name: &str, traceback: &str, message: &str) -> String {
    let mut context = md5::Context::new();
    context.consume(level.to_string().as_bytes());
    context.consume(class_name.as_bytes());
    if traceback.is_empty() {
        context.consume(message.as_bytes());
    } else {
        let lines: Vec<&str> = traceback.split('\n').collect();
        let keep = lines.len().saturating_sub(2);
        context.consume(lines[..keep].join("\n").as_bytes());
    }
    format!("{:x}", context.compute())
}

/// Render the canonical traceback text for a frame list.
///
/// One header line, two lines per frame (one when no source is available),
/// then the `Type: value` summary and a trailing newline. The fingerprint
/// contract depends on the summary occupying exactly the last two
/// newline-separated fields.
pub fn render_traceback(frames: &[Frame], type_name: &str, value: &str) -> String {
    let mut out = String::new();
    out.push_str(TRACEBACK_HEADER);
    out.push('\n');
    for frame in frames {
        out.push_str(&format!(
            "  File \"{}\", line {}, in {}\n",
            frame.filename, frame.lineno, frame.function
        ));
        if let Some(line) = &frame.context_line {
            out.push_str(&format!("    {}\n", line.trim()));
        }
    }
    if value.is_empty() {
        out.push_str(&format!("{type_name}\n"));
    } else {
        out.push_str(&format!("{type_name}: {value}\n"));
    }
    out
}
