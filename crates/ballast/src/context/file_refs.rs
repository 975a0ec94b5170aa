//! File references that survive compaction.
//!
//! Summaries and truncation notices lose the details of which files the
//! agent was working with. [`extract_file_references`] scans the messages
//! being compacted away for file paths in tool call arguments and user
//! mentions, so the compacted message can carry them forward in its
//! metadata.
//!
//! Recognized tools:
//! - `read` → read (`file_paths` array, or a single `file_path`)
//! - `edit`, `line-edit` → edited (`file_path`)
//! - `write` → written (`file_path`)

use crate::{FileSources, Message, MessageRole};
use indexmap::IndexSet;

/// Paths extracted from a span of messages, deduplicated and capped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReferences {
    /// Paths by how they were touched, after hierarchical dedup and capping.
    pub sources: FileSources,
    /// Flat list in priority order: edited, then written, then read.
    pub references: Vec<String>,
}

impl FileReferences {
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

#[derive(Default)]
struct Collected {
    read: IndexSet<String>,
    edited: IndexSet<String>,
    written: IndexSet<String>,
}

/// Collect file paths from `messages`, keeping at most `max_references`.
///
/// A path that was written is dropped from edited and read; a path that was
/// edited is dropped from read. Paths keep first-seen order within a set.
pub fn extract_file_references(messages: &[Message], max_references: usize) -> FileReferences {
    let mut collected = Collected::default();

    for msg in messages {
        match msg.role {
            MessageRole::Assistant => {
                for call in msg.calls() {
                    collect_from_call(call.name(), &call.function.arguments, &mut collected);
                }
            }
            MessageRole::User => {
                if let Some(mentions) = msg.metadata.as_ref().and_then(|m| m.mentions.as_ref()) {
                    for file in mentions.files.iter().filter(|f| !f.is_empty()) {
                        collected.read.insert(file.clone());
                    }
                }
            }
            _ => {}
        }
    }

    let Collected {
        mut read,
        mut edited,
        written,
    } = collected;
    edited.retain(|p| !written.contains(p));
    read.retain(|p| !edited.contains(p) && !written.contains(p));

    let mut remaining = max_references;
    let mut take = |set: IndexSet<String>| -> Vec<String> {
        let kept: Vec<String> = set.into_iter().take(remaining).collect();
        remaining -= kept.len();
        kept
    };
    let edited = take(edited);
    let written = take(written);
    let read = take(read);

    let references = edited
        .iter()
        .chain(written.iter())
        .chain(read.iter())
        .cloned()
        .collect();

    FileReferences {
        sources: FileSources {
            read,
            edited,
            written,
        },
        references,
    }
}

fn collect_from_call(tool_name: &str, arguments: &str, collected: &mut Collected) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(arguments) else {
        return;
    };
    let single = value
        .get("file_path")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    match tool_name.to_ascii_lowercase().as_str() {
        "read" => {
            if let Some(paths) = value.get("file_paths").and_then(|v| v.as_array()) {
                for path in paths.iter().filter_map(|p| p.as_str()) {
                    if !path.is_empty() {
                        collected.read.insert(path.to_string());
                    }
                }
            }
            if let Some(path) = single {
                collected.read.insert(path);
            }
        }
        "edit" | "line-edit" => {
            if let Some(path) = single {
                collected.edited.insert(path);
            }
        }
        "write" => {
            if let Some(path) = single {
                collected.written.insert(path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mentions, MessageMetadata, ToolCall};
    use serde_json::json;

    fn call(id: &str, name: &str, args: serde_json::Value) -> Message {
        Message::assistant_tool_calls(vec![ToolCall::from_value(id, name, &args)])
    }

    #[test]
    fn collects_by_tool_kind() {
        let messages = vec![
            call("1", "read", json!({"file_paths": ["a.rs", "b.rs"]})),
            call("2", "edit", json!({"file_path": "c.rs"})),
            call("3", "write", json!({"file_path": "d.rs"})),
            call("4", "grep", json!({"pattern": "foo"})),
        ];
        let refs = extract_file_references(&messages, 15);
        assert_eq!(refs.sources.read, vec!["a.rs", "b.rs"]);
        assert_eq!(refs.sources.edited, vec!["c.rs"]);
        assert_eq!(refs.sources.written, vec!["d.rs"]);
        assert_eq!(refs.references, vec!["c.rs", "d.rs", "a.rs", "b.rs"]);
    }

    #[test]
    fn written_supersedes_edited_and_read() {
        let messages = vec![
            call("1", "read", json!({"file_paths": ["a.rs", "b.rs"]})),
            call("2", "line-edit", json!({"file_path": "a.rs"})),
            call("3", "edit", json!({"file_path": "b.rs"})),
            call("4", "write", json!({"file_path": "b.rs"})),
        ];
        let refs = extract_file_references(&messages, 15);
        assert!(refs.sources.read.is_empty());
        assert_eq!(refs.sources.edited, vec!["a.rs"]);
        assert_eq!(refs.sources.written, vec!["b.rs"]);
    }

    #[test]
    fn user_mentions_count_as_reads() {
        let mention = Message::user("look at this").with_metadata(MessageMetadata {
            mentions: Some(Mentions {
                files: vec!["notes.md".into()],
            }),
            ..Default::default()
        });
        let refs = extract_file_references(&[mention], 15);
        assert_eq!(refs.sources.read, vec!["notes.md"]);
    }

    #[test]
    fn cap_fills_edited_then_written_then_read() {
        let mut messages = Vec::new();
        for i in 0..3 {
            let (e, w, r) = (format!("e{i}.rs"), format!("w{i}.rs"), format!("r{i}.rs"));
            messages.push(call(&format!("e{i}"), "edit", json!({"file_path": e})));
            messages.push(call(&format!("w{i}"), "write", json!({"file_path": w})));
            messages.push(call(&format!("r{i}"), "read", json!({"file_paths": [r]})));
        }
        let refs = extract_file_references(&messages, 4);
        assert_eq!(refs.references, vec!["e0.rs", "e1.rs", "e2.rs", "w0.rs"]);
        assert!(refs.sources.read.is_empty());
        assert_eq!(refs.sources.written, vec!["w0.rs"]);
    }

    #[test]
    fn malformed_arguments_are_ignored() {
        let messages = vec![
            Message::assistant_tool_calls(vec![ToolCall::new("1", "read", "not json")]),
            call("2", "edit", json!({"file_path": ""})),
        ];
        assert!(extract_file_references(&messages, 15).is_empty());
    }

    #[test]
    fn tool_results_are_not_scanned() {
        let messages = vec![Message::tool_result("1", r#"{"file_path": "x.rs"}"#)];
        assert!(extract_file_references(&messages, 15).is_empty());
    }
}
