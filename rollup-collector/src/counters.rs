use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::batch::{Batch, CounterEntry, FlushOptions};
use crate::protocol::{self, CounterValue, MetricKey, SOURCE_TAG, Tags};

/// Options of a single counter increment.
///
/// ```
/// use rollup_collector::Increment;
///
/// let increment = Increment::by(5.0).tag("region", "eu").sporadic();
/// assert!(increment.is_sporadic());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Increment {
    amount: CounterValue,
    tags: Tags,
    sporadic: bool,
}

impl Increment {
    /// An increment by one.
    pub fn new() -> Self {
        Self::by(1.0)
    }

    /// An increment by `amount`.
    pub fn by(amount: CounterValue) -> Self {
        Self {
            amount,
            tags: Tags::new(),
            sporadic: false,
        }
    }

    /// Adds a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Adds all given tags.
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Sets the legacy `source` dimension.
    pub fn source(self, source: impl ToString) -> Self {
        self.tag(SOURCE_TAG, source)
    }

    /// Removes the counter at the next flush unless it is incremented again before.
    pub fn sporadic(mut self) -> Self {
        self.sporadic = true;
        self
    }

    /// Returns the amount added by this increment.
    pub fn amount(&self) -> CounterValue {
        self.amount
    }

    /// Returns `true` if this is a sporadic increment.
    pub fn is_sporadic(&self) -> bool {
        self.sporadic
    }

    pub(crate) fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }
}

impl Default for Increment {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct CounterState {
    values: HashMap<MetricKey, CounterValue>,
    sporadic: HashSet<MetricKey>,
}

/// Thread-safe store of accumulating counters.
///
/// Continuous counters are reported with a value of `0` after a flush. Sporadic counters are
/// removed at flush, so a sporadic counter that was not incremented during an interval is not
/// reported at all.
#[derive(Debug, Default)]
pub struct CounterCache {
    state: Mutex<CounterState>,
    prefix: RwLock<Option<String>>,
}

impl CounterCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    pub fn increment(&self, name: &str) {
        self.increment_with(name, Increment::new());
    }

    /// Increments a counter by an integral amount.
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.increment_with(name, Increment::by(amount as CounterValue));
    }

    /// Applies an increment to the counter identified by `name` and the increment's tags.
    ///
    /// Counters only grow, so negative and non-finite amounts are ignored.
    pub fn increment_with(&self, name: &str, increment: Increment) {
        let Increment {
            amount,
            tags,
            sporadic,
        } = increment;

        if !amount.is_finite() || amount < 0.0 {
            rollup_log::warn!(metric = name, amount, "ignoring invalid counter increment");
            return;
        }

        let key = MetricKey::with_tags(name, tags);

        let mut state = self.state.lock();
        if sporadic {
            state.sporadic.insert(key.clone());
        } else {
            // A continuous increment makes the counter continuous again.
            state.sporadic.remove(&key);
        }
        *state.values.entry(key).or_insert(0.0) += amount;
    }

    /// Returns the current value of a counter without creating it.
    pub fn fetch(&self, name: &str, tags: &Tags) -> Option<CounterValue> {
        let key = MetricKey::with_tags(name, tags.clone());
        self.state.lock().values.get(&key).copied()
    }

    /// Detaches all counters into `batch` and returns the number of flushed counters.
    ///
    /// Unless [`FlushOptions::preserve`] is set, sporadic counters are removed and all other
    /// counters are reset to zero. Prefixing and copying into the batch happen after the lock is
    /// released.
    pub fn flush_to(&self, batch: &mut Batch, options: FlushOptions) -> usize {
        let snapshot: Vec<(MetricKey, CounterValue)> = {
            let mut state = self.state.lock();
            if state.values.is_empty() {
                return 0;
            }

            let snapshot = state
                .values
                .iter()
                .map(|(key, value)| (key.clone(), *value))
                .collect();

            if !options.preserve {
                let CounterState { values, sporadic } = &mut *state;
                for key in sporadic.drain() {
                    values.remove(&key);
                }
                values.values_mut().for_each(|value| *value = 0.0);
            }

            snapshot
        };

        let prefix = self.prefix.read().clone();
        let flushed = snapshot.len();
        batch.counters.extend(snapshot.into_iter().map(|(key, value)| CounterEntry {
            name: protocol::qualify(prefix.as_deref(), &key.name),
            tags: key.tags,
            value,
        }));

        flushed
    }

    /// Removes all counters.
    pub fn delete_all(&self) {
        let mut state = self.state.lock();
        state.values.clear();
        state.sporadic.clear();
    }

    /// Sets the prefix applied to counter names at flush.
    pub fn set_prefix(&self, prefix: Option<String>) {
        *self.prefix.write() = prefix;
    }

    /// Returns the number of tracked counters.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Returns `true` if no counters are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
