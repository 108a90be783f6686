//! Stack frame extraction and the hint-driven visibility pass.
//!
//! Producers describe the raise site as a list of [`RawFrame`]s, outermost
//! first, usually built with the [`frame!`](crate::frame!) macro. Extraction
//! canonicalizes the local snapshots, pulls source context from disk when the
//! file is readable, and resolves per-frame hide hints into the final
//! `visible` flags.

use std::fs;

use serde_json::Map;

use faultline_types::{transform, CapturedValue, Frame};

/// Lines of source context captured on each side of the frame line.
const CONTEXT_LINES: usize = 5;

/// Per-frame visibility hint, set by code that wants its frames hidden from
/// (or restored to) rendered tracebacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideHint {
    /// Hide everything captured so far; show this frame.
    Before,
    /// Hide everything captured so far and this frame.
    BeforeAndThis,
    /// Stop hiding; show this frame.
    Reset,
    /// Stop hiding; skip this frame.
    ResetAndThis,
    /// Hide the frames that follow; show this frame.
    After,
    /// Hide the frames that follow and this frame.
    AfterAndThis,
    /// Unrecognized truthy hint: skip just this frame.
    Other,
}

/// One raw stack frame as captured at the raise site.
#[derive(Debug)]
pub struct RawFrame {
    /// Source file path.
    pub filename: String,
    /// Module path of the frame, `::`-separated.
    pub module: String,
    /// Function name.
    pub function: String,
    /// 1-based line number.
    pub lineno: u32,
    /// Named local values snapshotted at capture time.
    pub locals: Vec<(String, CapturedValue)>,
    /// Optional visibility hint.
    pub hide: Option<HideHint>,
}

impl RawFrame {
    /// Build a frame with no locals and no hint.
    pub fn new(
        filename: impl Into<String>,
        module: impl Into<String>,
        function: impl Into<String>,
        lineno: u32,
    ) -> Self {
        Self {
            filename: filename.into(),
            module: module.into(),
            function: function.into(),
            lineno,
            locals: Vec::new(),
            hide: None,
        }
    }

    /// Attach a named local value.
    pub fn with_local(mut self, name: impl Into<String>, value: impl Into<CapturedValue>) -> Self {
        self.locals.push((name.into(), value.into()));
        self
    }

    /// Attach a visibility hint.
    pub fn with_hide(mut self, hint: HideHint) -> Self {
        self.hide = Some(hint);
        self
    }
}

/// Capture a [`RawFrame`] at the call site.
///
/// `frame!("handler")` records file, module path, and line number;
/// `frame!("handler", { key = value, .. })` additionally snapshots locals.
/// Values must convert into [`CapturedValue`].
#[macro_export]
macro_rules! frame {
    ($function:expr) => {
        $crate::RawFrame::new(file!(), module_path!(), $function, line!())
    };
    ($function:expr, { $($name:ident = $value:expr),* $(,)? }) => {{
        #[allow(unused_mut)]
        let mut raw = $crate::RawFrame::new(file!(), module_path!(), $function, line!());
        $(raw.locals.push((stringify!($name).to_string(), $crate::CapturedValue::from($value)));)*
        raw
    }};
}

/// Turn raw frames into finished [`Frame`] records, outermost first.
pub fn extract_frames(raw: Vec<RawFrame>) -> Vec<Frame> {
    let visible = visible_indices(&raw);
    raw.into_iter()
        .enumerate()
        .map(|(index, frame)| {
            let (context_line, with_context) = source_context(&frame.filename, frame.lineno);
            let mut vars = Map::with_capacity(frame.locals.len());
            for (name, value) in &frame.locals {
                vars.insert(name.clone(), transform(value));
            }
            Frame {
                id: index as i64,
                filename: frame.filename,
                module: or_unknown(frame.module),
                function: or_unknown(frame.function),
                lineno: frame.lineno,
                vars,
                context_line,
                with_context,
                visible: visible.as_ref().map_or(true, |v| v.contains(&index)),
            }
        })
        .collect()
}

fn or_unknown(name: String) -> String {
    if name.is_empty() {
        "?".to_string()
    } else {
        name
    }
}

/// Resolve hide hints into the set of visible frame indexes.
///
/// `None` means the filtering was discarded: the innermost frame must always
/// be shown, and if the hints would have hidden it the error happened inside
/// "hidden" code, so everything is shown instead.
fn visible_indices(raw: &[RawFrame]) -> Option<Vec<usize>> {
    if raw.is_empty() {
        return None;
    }
    let mut visible = Vec::with_capacity(raw.len());
    let mut hidden = false;
    for (index, frame) in raw.iter().enumerate() {
        match frame.hide {
            Some(HideHint::Before) => {
                visible.clear();
                hidden = false;
            }
            Some(HideHint::BeforeAndThis) => {
                visible.clear();
                hidden = false;
                continue;
            }
            Some(HideHint::Reset) => hidden = false,
            Some(HideHint::ResetAndThis) => {
                hidden = false;
                continue;
            }
            Some(HideHint::After) => hidden = true,
            Some(HideHint::AfterAndThis) => {
                hidden = true;
                continue;
            }
            Some(HideHint::Other) => continue,
            None => {
                if hidden {
                    continue;
                }
            }
        }
        visible.push(index);
    }
    if visible.last() != Some(&(raw.len() - 1)) {
        return None;
    }
    Some(visible)
}

fn source_context(filename: &str, lineno: u32) -> (Option<String>, Vec<String>) {
    let Ok(source) = fs::read_to_string(filename) else {
        return (None, Vec::new());
    };
    let lines: Vec<&str> = source.lines().collect();
    let index = (lineno as usize).saturating_sub(1);
    let line = lines.get(index).map(|l| l.to_string());
    let start = index.saturating_sub(CONTEXT_LINES);
    let end = (index + CONTEXT_LINES + 1).min(lines.len());
    let window = if start < lines.len() {
        lines[start..end].iter().map(|l| l.to_string()).collect()
    } else {
        Vec::new()
    };
    (line, window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn plain(name: &str) -> RawFrame {
        RawFrame::new("src/missing.rs", "app::web", name, 1)
    }

    fn hinted(name: &str, hint: HideHint) -> RawFrame {
        plain(name).with_hide(hint)
    }

    fn visible_names(frames: &[Frame]) -> Vec<&str> {
        frames
            .iter()
            .filter(|f| f.visible)
            .map(|f| f.function.as_str())
            .collect()
    }

    #[test]
    fn test_no_hints_shows_everything() {
        let frames = extract_frames(vec![plain("outer"), plain("inner")]);
        assert_eq!(visible_names(&frames), vec!["outer", "inner"]);
    }

    #[test]
    fn test_after_hides_following_frames_failsafe_applies() {
        // `after` includes its own frame but hides the rest, which would
        // hide the error site; the failsafe discards the filtering.
        let frames = extract_frames(vec![hinted("boundary", HideHint::After), plain("inner")]);
        assert_eq!(visible_names(&frames), vec!["boundary", "inner"]);
    }

    #[test]
    fn test_after_then_reset() {
        let frames = extract_frames(vec![
            plain("outer"),
            hinted("boundary", HideHint::After),
            plain("framework"),
            hinted("handler", HideHint::Reset),
            plain("inner"),
        ]);
        assert_eq!(
            visible_names(&frames),
            vec!["outer", "boundary", "handler", "inner"]
        );
    }

    #[test]
    fn test_before_discards_earlier_frames() {
        let frames = extract_frames(vec![
            plain("bootstrap"),
            plain("framework"),
            hinted("entry", HideHint::Before),
            plain("inner"),
        ]);
        assert_eq!(visible_names(&frames), vec!["entry", "inner"]);
    }

    #[test]
    fn test_before_and_this_also_skips_itself() {
        let frames = extract_frames(vec![
            plain("bootstrap"),
            hinted("entry", HideHint::BeforeAndThis),
            plain("inner"),
        ]);
        assert_eq!(visible_names(&frames), vec!["inner"]);
    }

    #[test]
    fn test_reset_and_this_skips_itself() {
        let frames = extract_frames(vec![
            hinted("boundary", HideHint::After),
            plain("framework"),
            hinted("handler", HideHint::ResetAndThis),
            plain("inner"),
        ]);
        assert_eq!(visible_names(&frames), vec!["boundary", "inner"]);
    }

    #[test]
    fn test_unknown_truthy_hint_skips_one_frame() {
        let frames = extract_frames(vec![
            plain("outer"),
            hinted("glue", HideHint::Other),
            plain("inner"),
        ]);
        assert_eq!(visible_names(&frames), vec!["outer", "inner"]);
    }

    #[test]
    fn test_last_frame_is_always_visible() {
        let frames = extract_frames(vec![
            plain("outer"),
            hinted("boundary", HideHint::AfterAndThis),
            plain("inner"),
        ]);
        assert!(frames.last().unwrap().visible);
        // Failsafe: the filtering was discarded wholesale.
        assert_eq!(visible_names(&frames), vec!["outer", "boundary", "inner"]);
    }

    #[test]
    fn test_unknown_module_and_function_become_question_marks() {
        let frames = extract_frames(vec![RawFrame::new("src/missing.rs", "", "", 1)]);
        assert_eq!(frames[0].module, "?");
        assert_eq!(frames[0].function, "?");
    }

    #[test]
    fn test_locals_are_canonicalized() {
        let raw = plain("inner")
            .with_local("key", "no_name")
            .with_local("attempts", 3i64);
        let frames = extract_frames(vec![raw]);
        assert_eq!(frames[0].vars["key"], "no_name");
        assert_eq!(frames[0].vars["attempts"], 3);
    }

    #[test]
    fn test_source_context_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for n in 1..=20 {
            writeln!(file, "line {n}").unwrap();
        }
        let path = file.path().to_string_lossy().into_owned();

        let frames = extract_frames(vec![RawFrame::new(path, "app", "inner", 10)]);
        assert_eq!(frames[0].context_line.as_deref(), Some("line 10"));
        assert_eq!(frames[0].with_context.len(), 11);
        assert_eq!(frames[0].with_context[0], "line 5");
        assert_eq!(frames[0].with_context[10], "line 15");
    }

    #[test]
    fn test_unreadable_source_leaves_context_empty() {
        let frames = extract_frames(vec![plain("inner")]);
        assert_eq!(frames[0].context_line, None);
        assert!(frames[0].with_context.is_empty());
    }

    #[test]
    fn test_frame_macro_captures_location() {
        let raw = frame!("test_frame_macro_captures_location", { attempts = 2i64 });
        assert!(raw.filename.ends_with("frames.rs"));
        assert!(raw.module.contains("frames"));
        assert_eq!(raw.locals.len(), 1);
        assert_eq!(raw.locals[0].0, "attempts");
    }
}
