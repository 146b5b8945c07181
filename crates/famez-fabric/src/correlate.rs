//! Correlation tags and the diagnostic tracker.
//!
//! A sender that needs an acknowledgment appends `,Tag=<n>` to its CSV and
//! records the outstanding entry; the matching `Standalone Acknowledgment`
//! retires it. Tags have no timeout; growth of the outstanding map is
//! bounded only by peer cooperation, so the map is logged after every
//! retirement.

use std::collections::BTreeMap;

use tracing::debug;

/// One outstanding tagged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    /// Originator's subnet id at send time.
    pub sid: u64,
    /// Originator's component id at send time.
    pub cid: u64,
    /// The tagged payload as it went out.
    pub payload: String,
    /// Payload to send immediately once the ACK arrives.
    pub after_ack: Option<String>,
}

/// The process-wide tag registry.
pub struct Correlator {
    next_tag: u32,
    outstanding: BTreeMap<u32, TagEntry>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_tag: 1,
            outstanding: BTreeMap::new(),
        }
    }

    /// Tag `payload`, record it as outstanding, and return the tag plus
    /// the payload with `,Tag=<n>` appended.
    pub fn tag(
        &mut self,
        sid: u64,
        cid: u64,
        payload: &str,
        after_ack: Option<&str>,
    ) -> (u32, String) {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let tagged = format!("{},Tag={}", payload, tag);
        self.outstanding.insert(
            tag,
            TagEntry {
                sid,
                cid,
                payload: tagged.clone(),
                after_ack: after_ack.map(str::to_string),
            },
        );
        (tag, tagged)
    }

    /// Retire a tag when its acknowledgment arrives. `None` means the tag
    /// was never outstanding (or already retired).
    pub fn complete(&mut self, tag: u32) -> Option<TagEntry> {
        let entry = self.outstanding.remove(&tag);
        if !self.outstanding.is_empty() {
            debug!(
                tags = ?self.outstanding.keys().collect::<Vec<_>>(),
                "outstanding tags"
            );
        }
        entry
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide monotonically increasing payload tracker. Purely
/// diagnostic; never used for correlation.
pub struct Tracker {
    next: u64,
}

impl Tracker {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> u64 {
        let n = self.next;
        self.next += 1;
        n
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
