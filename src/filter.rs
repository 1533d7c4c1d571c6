//! Extraction of the `<prompt>…</prompt>` payload from a streamed completion.
//!
//! [`TagScanner`] is the synchronous state machine: it is fed fragments in
//! arrival order and hands back whatever payload text is already safe to
//! release. [`TagBoundaryFilter`] drives a scanner from any upstream
//! [`Stream`] of fragments and is itself a stream of payload fragments.
//!
//! Delimiters may be split across any number of fragments. Text that
//! could still turn out to be the start of the end tag is held back, so the
//! scanner never buffers more than `END_TAG.len() - 1` bytes of payload, and
//! never more than `START_TAG.len() - 1` bytes while looking for the start.
//!
//! If the upstream ends after the start tag but before the end tag, the
//! held-back tail is dropped rather than flushed. The filter reports this
//! through [`FilterOutcome::Unterminated`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

pub const START_TAG: &str = "<prompt>";
pub const END_TAG: &str = "</prompt>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SearchingStart,
    InPayload,
    Done,
}

/// How a filtered stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Upstream still has, or may still have, fragments to deliver.
    Pending,
    /// Upstream ended without ever producing the start tag.
    NoStartTag,
    /// The end tag was found; the full payload was emitted.
    Completed,
    /// Upstream ended inside the payload; `dropped` held-back bytes were
    /// never emitted.
    Unterminated { dropped: usize },
}

#[derive(Debug, Clone)]
pub struct TagScanner {
    phase: Phase,
    pre_start: String,
    pending: String,
    outcome: FilterOutcome,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            phase: Phase::SearchingStart,
            pre_start: String::new(),
            pending: String::new(),
            outcome: FilterOutcome::Pending,
        }
    }

    /// True once the end tag was seen or the input was finished.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn outcome(&self) -> FilterOutcome {
        self.outcome
    }

    /// Consume one fragment and return the payload text it released, if any.
    pub fn feed(&mut self, fragment: &str) -> Option<String> {
        match self.phase {
            Phase::Done => None,
            Phase::InPayload => self.scan_payload(fragment),
            Phase::SearchingStart => {
                self.pre_start.push_str(fragment);
                let Some(pos) = self.pre_start.find(START_TAG) else {
                    keep_tail(&mut self.pre_start, START_TAG.len() - 1);
                    return None;
                };

                let rest = self.pre_start.split_off(pos + START_TAG.len());
                self.pre_start = String::new();
                self.phase = Phase::InPayload;
                debug!("start tag found");
                self.scan_payload(&rest)
            }
        }
    }

    /// Signal that upstream is exhausted. Held-back text is discarded.
    pub fn finish(&mut self) {
        self.outcome = match self.phase {
            Phase::Done => return,
            Phase::SearchingStart => FilterOutcome::NoStartTag,
            Phase::InPayload => {
                let dropped = self.pending.len();
                warn!(dropped_bytes = dropped, "stream ended before end tag");
                FilterOutcome::Unterminated { dropped }
            }
        };
        self.phase = Phase::Done;
        self.pre_start.clear();
        self.pending.clear();
    }

    fn scan_payload(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);

        if let Some(end) = self.pending.find(END_TAG) {
            self.pending.truncate(end);
            let payload = std::mem::take(&mut self.pending);
            self.phase = Phase::Done;
            self.outcome = FilterOutcome::Completed;
            debug!("end tag found");
            return non_empty(payload);
        }

        let held = partial_tag_suffix(&self.pending, END_TAG);
        let tail = self.pending.split_off(self.pending.len() - held);
        non_empty(std::mem::replace(&mut self.pending, tail))
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    let max = text.len().min(tag.len() - 1);
    (1..=max)
        .rev()
        .find(|&len| text.as_bytes().ends_with(&tag.as_bytes()[..len]))
        .unwrap_or(0)
}

/// Keep at most `max` trailing bytes of `buf`, cut on a char boundary.
fn keep_tail(buf: &mut String, max: usize) {
    if buf.len() <= max {
        return;
    }
    let mut cut = buf.len() - max;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    buf.drain(..cut);
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Stream adapter that yields only the delimited payload of `upstream`.
///
/// The upstream is dropped as soon as the end tag is seen, and dropping the
/// filter drops the upstream with it, which is how a finished or abandoned
/// response releases the backend connection.
pub struct TagBoundaryFilter<S> {
    upstream: Option<S>,
    scanner: TagScanner,
}

impl<S> TagBoundaryFilter<S>
where
    S: Stream + Unpin,
    S::Item: AsRef<str>,
{
    pub fn new(upstream: S) -> Self {
        Self {
            upstream: Some(upstream),
            scanner: TagScanner::new(),
        }
    }

    pub fn outcome(&self) -> FilterOutcome {
        self.scanner.outcome()
    }

    /// Whether the upstream is still held.
    pub fn is_upstream_attached(&self) -> bool {
        self.upstream.is_some()
    }
}

impl<S> Stream for TagBoundaryFilter<S>
where
    S: Stream + Unpin,
    S::Item: AsRef<str>,
{
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.scanner.is_done() {
                this.upstream = None;
                return Poll::Ready(None);
            }
            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };

            match upstream.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(fragment)) => {
                    let released = this.scanner.feed(fragment.as_ref());
                    if this.scanner.is_done() {
                        this.upstream = None;
                    }
                    if let Some(text) = released {
                        return Poll::Ready(Some(text));
                    }
                }
                Poll::Ready(None) => {
                    this.scanner.finish();
                    this.upstream = None;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match (&self.upstream, self.scanner.is_done()) {
            (Some(_), false) => (0, None),
            _ => (0, Some(0)),
        }
    }
}
