//! Out-of-band binary attachment correlation
//!
//! With the legacy wire format, binary values travel as raw frames. The
//! server first announces placeholder keys, then sends one raw frame per
//! key, then a reply whose result references the keys as `wslink_bin<N>`
//! strings.

use bytes::Bytes;
use std::collections::VecDeque;
use wslink_proto::Value;

#[derive(Debug)]
struct Attachment {
    key: String,
    data: Option<Bytes>,
}

/// Queue of announced attachments, filled in arrival order
#[derive(Debug, Default)]
pub struct AttachmentQueue {
    entries: VecDeque<Attachment>,
}

impl AttachmentQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce keys whose payloads follow as raw frames
    pub fn declare<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.extend(keys.into_iter().map(|key| Attachment { key: key.into(), data: None }));
    }

    /// Store a raw frame in the first announced entry still lacking data
    ///
    /// Returns `false` when no such entry exists; the frame is dropped.
    pub fn fill(&mut self, data: Bytes) -> bool {
        match self.entries.iter_mut().find(|entry| entry.data.is_none()) {
            Some(entry) => {
                entry.data = Some(data);
                true
            }
            None => false,
        }
    }

    /// Replace every placeholder in `value` that has a filled attachment
    ///
    /// Each substituted attachment is consumed. Returns the placeholder
    /// tokens left untouched for lack of a filled attachment.
    pub fn substitute(&mut self, value: &mut Value) -> Vec<String> {
        let mut unresolved = Vec::new();

        value.visit_placeholders_mut(&mut |node: &mut Value| {
            let Some(token) = node.as_str().map(str::to_owned) else {
                return;
            };

            let index = self.entries.iter().position(|entry| entry.key == token && entry.data.is_some());
            match index.and_then(|i| self.entries.remove(i)).and_then(|entry| entry.data) {
                Some(data) => *node = Value::Binary(data),
                None => unresolved.push(token),
            }
        });

        unresolved
    }

    /// Drop every announced attachment
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of announced attachments not yet consumed
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attachment is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
