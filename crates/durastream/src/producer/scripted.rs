use super::{GenerationRequest, ProducerFactory};
use crate::Result;
use core::time::Duration;
use futures::{StreamExt, stream::BoxStream};
use std::sync::Arc;

/// A deterministic stand-in for a slow text generator.
///
/// Splits a fixed text into fragments of `words_per_fragment` words and
/// yields them one at a time, sleeping `fragment_delay` before each. Leading
/// whitespace is kept on every word so concatenating the fragments rebuilds
/// the text.
#[derive(Debug, Clone)]
pub struct ScriptedProducer {
    text: Arc<str>,
    words_per_fragment: usize,
    fragment_delay: Duration,
}

impl ScriptedProducer {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            words_per_fragment: 1,
            fragment_delay: Duration::ZERO,
        }
    }

    /// Sets how many words go into each fragment. Values below 1 are treated
    /// as 1.
    #[must_use]
    pub fn with_words_per_fragment(mut self, words: usize) -> Self {
        self.words_per_fragment = words.max(1);
        self
    }

    #[must_use]
    pub const fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// The fragments one run of this producer yields, in order.
    pub fn fragments(&self) -> Vec<String> {
        let mut fragments = Vec::new();
        let mut current = String::new();
        let mut words = 0;

        for word in split_keep_leading_whitespace(&self.text) {
            current.push_str(word);
            words += 1;
            if words == self.words_per_fragment {
                fragments.push(core::mem::take(&mut current));
                words = 0;
            }
        }
        if !current.is_empty() {
            fragments.push(current);
        }
        fragments
    }
}

impl ProducerFactory for ScriptedProducer {
    type Fragments = BoxStream<'static, Result<String>>;

    fn start(&self, request: &GenerationRequest) -> Self::Fragments {
        tracing::debug!(
            stream_id = %request.stream_id,
            params = ?request.params,
            "Starting scripted producer"
        );
        let delay = self.fragment_delay;

        futures::stream::iter(self.fragments())
            .then(move |fragment| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(fragment)
            })
            .boxed()
    }
}

/// Splits `text` into words, each carrying the whitespace that precedes it.
fn split_keep_leading_whitespace(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    core::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let word_start = rest.find(|c: char| !c.is_whitespace()).unwrap_or(rest.len());
        let word_end = rest[word_start..]
            .find(char::is_whitespace)
            .map_or(rest.len(), |i| word_start + i);
        let (word, tail) = rest.split_at(word_end);
        rest = tail;
        Some(word)
    })
}
