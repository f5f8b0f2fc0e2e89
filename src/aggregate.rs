use std::cmp::Ordering;
use std::collections::HashMap;

use crate::domain::KeyValue;

#[derive(Debug, Default)]
struct Tally {
    // (value, count) in order of first appearance
    counts: Vec<(String, usize)>,
}

impl Tally {
    fn add(&mut self, value: String) {
        match self.counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((value, 1)),
        }
    }

    fn into_mode(self) -> Option<String> {
        let mut best: Option<(String, usize)> = None;
        for (value, count) in self.counts {
            if best.as_ref().is_none_or(|(_, top)| count > *top) {
                best = Some((value, count));
            }
        }
        best.map(|(value, _)| value)
    }
}

/// Running most-frequent-value tally per key.
///
/// Memory grows with the number of distinct `(key, value)` pairs, not with
/// the number of pairs fed in.
#[derive(Debug, Default)]
pub struct Aggregator {
    groups: HashMap<String, Tally>,
}

impl Aggregator {
    pub fn add(&mut self, pair: KeyValue) {
        self.groups.entry(pair.key).or_default().add(pair.value);
    }

    /// Most frequent value per key. Equal counts resolve to the value seen first.
    /// Keys come out ascending, numeric keys in numeric order.
    pub fn finish(self) -> Vec<KeyValue> {
        let mut result: Vec<KeyValue> = self
            .groups
            .into_iter()
            .filter_map(|(key, tally)| {
                let value = tally.into_mode()?;
                Some(KeyValue { key, value })
            })
            .collect();
        result.sort_by(|a, b| compare_keys(&a.key, &b.key));
        result
    }
}

// Integer keys first, by value; anything else after, lexicographically.
fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
