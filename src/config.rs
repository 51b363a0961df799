//! Topic configuration and the retry chain derived from it.
//!
//! A [`Config`] enumerates each *main topic* together with its ordered list
//! of retry intervals. From that declaration the config materialises:
//!
//! - the stage topic chain `[main, retry1, …, retryN, deadLetter]` per topic,
//! - the forward edge used by the chain backend ([`Config::next_topic_in_chain`]),
//! - the stage descriptors used by the database backend ([`Config::stages`]).
//!
//! Stage topics follow the `<main>.retry<n>` / `<main>.deadLetter` naming
//! convention. All stage topics of a main topic resolve to the same *topic
//! key* ([`Config::find_topic_key`]), which is what handlers are registered
//! under.

use std::collections::HashMap;
use std::time::Duration;

use crate::group::GroupConfig;

const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SUCCESSFUL_RETENTION: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// One topic in a retry chain, main or auxiliary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaTopic {
    /// Full topic name on the log, e.g. `orders.retry2`.
    pub name: String,
    /// Wait before an attempt on this topic is due. Zero for main and
    /// dead-letter topics.
    pub delay: Duration,
    /// The topic key all stages of this chain share.
    pub key: String,
    /// True for the main (first) topic of the chain.
    pub is_main: bool,
    next: Option<String>,
}

/// A database retry stage for one main topic.
///
/// `sequence` doubles as the `attempts` value a row must have to be a
/// candidate for this stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStage {
    /// Zero-based stage number.
    pub sequence: i16,
    /// Minimum wait since the row was last updated.
    pub interval: Duration,
    /// Topic key used to resolve the handler.
    pub key: String,
}

/// Error returned by [`Config::next_topic_in_chain`] for terminal topics.
#[derive(Debug)]
pub struct NoSuccessor {
    topic: String,
}

impl std::fmt::Display for NoSuccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "topic '{}' has no successor in the retry chain", self.topic)
    }
}

impl std::error::Error for NoSuccessor {}

/// Library configuration.
///
/// Built with [`Config::new`] plus consuming `with_*` setters:
///
/// ```
/// use std::time::Duration;
/// use redrive::Config;
///
/// let config = Config::new(vec!["localhost:9092".into()], "orders-service")
///     .with_topic("orders", vec![Duration::from_secs(30)])
///     .with_db_for_retry_queue(true)
///     .with_db_dsn("postgres://localhost/orders");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    hosts: Vec<String>,
    retry_hosts: Vec<String>,
    group: String,
    tls_enable: bool,
    tls_skip_verify: bool,
    use_db_for_retry_queue: bool,
    maintenance_interval: Duration,
    successful_retention: Duration,
    db_dsn: Option<String>,
    topics: HashMap<String, KafkaTopic>,
    main_topics: Vec<String>,
    consumable: Vec<String>,
    db_retries: HashMap<String, Vec<RetryStage>>,
}

impl Config {
    /// Create a configuration for the given broker hosts and consumer group.
    pub fn new(hosts: Vec<String>, group: impl Into<String>) -> Self {
        Self {
            hosts,
            retry_hosts: Vec::new(),
            group: group.into(),
            tls_enable: false,
            tls_skip_verify: false,
            use_db_for_retry_queue: false,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            successful_retention: DEFAULT_SUCCESSFUL_RETENTION,
            db_dsn: None,
            topics: HashMap::new(),
            main_topics: Vec::new(),
            consumable: Vec::new(),
            db_retries: HashMap::new(),
        }
    }

    /// Declare a main topic and its retry schedule.
    ///
    /// Each interval adds one retry stage; the chain always ends in a
    /// dead-letter topic. Repeatable.
    pub fn with_topic(mut self, name: impl Into<String>, intervals: Vec<Duration>) -> Self {
        let name = name.into();
        let dead_letter = format!("{name}.deadLetter");

        let mut chain = Vec::with_capacity(intervals.len() + 2);
        chain.push((name.clone(), Duration::ZERO, true));
        for (i, interval) in intervals.iter().enumerate() {
            chain.push((format!("{}.retry{}", name, i + 1), *interval, false));
        }
        chain.push((dead_letter, Duration::ZERO, false));

        for (i, (topic_name, delay, is_main)) in chain.iter().enumerate() {
            let next = chain.get(i + 1).map(|(n, _, _)| n.clone());
            self.topics.insert(
                topic_name.clone(),
                KafkaTopic {
                    name: topic_name.clone(),
                    delay: *delay,
                    key: name.clone(),
                    is_main: *is_main,
                    next,
                },
            );
            // The dead-letter topic is produced to, never consumed.
            if i < chain.len() - 1 {
                self.consumable.push(topic_name.clone());
            }
        }

        let stages = intervals
            .iter()
            .enumerate()
            .map(|(i, interval)| RetryStage {
                sequence: i as i16,
                interval: *interval,
                key: name.clone(),
            })
            .collect();
        self.db_retries.insert(name.clone(), stages);
        self.main_topics.push(name);
        self
    }

    /// Use a distinct broker endpoint for all non-main stage consumers.
    pub fn with_retry_host(mut self, hosts: Vec<String>) -> Self {
        self.retry_hosts = hosts;
        self
    }

    /// Enable TLS on broker connections.
    pub fn with_tls(mut self, enable: bool) -> Self {
        self.tls_enable = enable;
        self
    }

    /// Skip TLS peer verification.
    pub fn with_tls_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = skip;
        self
    }

    /// Select the database retry queue instead of the retry-topic chain.
    pub fn with_db_for_retry_queue(mut self, enable: bool) -> Self {
        self.use_db_for_retry_queue = enable;
        self
    }

    /// Connection string for the retry database.
    pub fn with_db_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.db_dsn = Some(dsn.into());
        self
    }

    /// How often the maintenance sweep runs. Defaults to one hour.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// How long successfully retried rows are kept before the maintenance
    /// sweep deletes them. Defaults to seven days.
    pub fn with_successful_retention(mut self, retention: Duration) -> Self {
        self.successful_retention = retention;
        self
    }

    /// The main topics, in declaration order.
    pub fn main_topics(&self) -> &[String] {
        &self.main_topics
    }

    /// Every topic a consumer group is started for, in chain order per main
    /// topic: main first, then each retry stage. Dead-letter topics are
    /// excluded.
    pub fn consumable_topics(&self) -> impl Iterator<Item = &KafkaTopic> {
        self.consumable.iter().filter_map(|name| self.topics.get(name))
    }

    /// The successor of `topic` in its retry chain.
    pub fn next_topic_in_chain(&self, topic: &str) -> Result<&KafkaTopic, NoSuccessor> {
        self.topics
            .get(topic)
            .and_then(|t| t.next.as_deref())
            .and_then(|next| self.topics.get(next))
            .ok_or_else(|| NoSuccessor {
                topic: topic.to_owned(),
            })
    }

    /// Resolve the topic key shared by all stages of `topic`'s chain.
    pub fn find_topic_key(&self, topic: &str) -> Option<&str> {
        self.topics.get(topic).map(|t| t.key.as_str())
    }

    /// Database retry stages for a main topic.
    pub fn stages(&self, main_topic: &str) -> &[RetryStage] {
        self.db_retries
            .get(main_topic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the database backend was selected.
    pub fn use_db_for_retry_queue(&self) -> bool {
        self.use_db_for_retry_queue
    }

    /// The configured database connection string, if any.
    pub fn db_dsn(&self) -> Option<&str> {
        self.db_dsn.as_deref()
    }

    /// Maintenance sweep cadence.
    pub fn maintenance_interval(&self) -> Duration {
        self.maintenance_interval
    }

    /// Retention for successfully retried rows.
    pub fn successful_retention(&self) -> Duration {
        self.successful_retention
    }

    /// Consumer-group connection settings.
    ///
    /// With `retry` set, the retry endpoint is used when one is configured;
    /// main-topic consumers always use the primary hosts.
    pub fn group_config(&self, retry: bool) -> GroupConfig {
        let brokers = if retry && !self.retry_hosts.is_empty() {
            self.retry_hosts.clone()
        } else {
            self.hosts.clone()
        };
        GroupConfig {
            brokers,
            group_id: self.group.clone(),
            session_timeout: Duration::from_secs(20),
            tls_enable: self.tls_enable,
            tls_skip_verify: self.tls_skip_verify,
        }
    }
}
