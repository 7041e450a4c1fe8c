//! zkul configs

pub mod cli {
    //! Parse from either cli or env var

    /// default ZooKeeper servers
    pub static DEFAULT_URLS: &str = "localhost:2181";
    /// default wait for a usable connection, in milliseconds
    pub const DEFAULT_TIMEOUT_MS: u64 = 16_000;
    /// default log level. Can use this argument or ZKUL_LOG env var
    pub const DEFAULT_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";
    /// default lock used by `demo`
    pub static DEFAULT_DEMO_LOCK: &str = "/critical/section";

    use std::time::Duration;

    pub use clap::Parser;
    use clap::Subcommand;
    use zk_ultralight::ConnectionOptions;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "zkul", bin_name = "zkul", about, long_about = None)]
    /// distributed locks and node-tree utilities for ZooKeeper. zkul will load `.env` in the working dir as well
    pub struct Config {
        /// comma-separated ZooKeeper servers, e.g. "zk1:2181,zk2:2181"
        #[clap(
            long,
            env = "ZKUL_URLS",
            value_delimiter = ',',
            default_value = DEFAULT_URLS
        )]
        pub urls: Vec<String>,
        /// session timeout, and how long to wait for a usable connection (ms)
        #[clap(long, env = "ZKUL_TIMEOUT_MS", value_parser, default_value_t = DEFAULT_TIMEOUT_MS)]
        pub timeout_ms: u64,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env = "ZKUL_LOG", value_parser, default_value = DEFAULT_LOG)]
        pub log: String,
        /// log output format
        #[clap(long, env = "ZKUL_LOG_FORMAT", value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        #[clap(subcommand)]
        pub command: Command,
    }

    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// acquire a lock, hold it, then release it
        Lock {
            /// fully-qualified lock path, e.g. /critical/section
            name: String,
            /// written to the lock node, good for debugging
            #[clap(long, default_value = "zkul")]
            owner: String,
            /// how long to hold the lock before releasing (ms)
            #[clap(long, default_value_t = 0)]
            hold_ms: u64,
        },
        /// print every ephemeral node under the given roots as JSON
        Ephemerals {
            #[clap(required = true)]
            roots: Vec<String>,
        },
        /// print every non-ephemeral leaf under the given roots as JSON
        NonEphemerals {
            #[clap(required = true)]
            roots: Vec<String>,
        },
        /// remove the nodes listed as a JSON array on stdin
        Rm,
        /// two clients contending for one lock on an in-memory cluster
        Demo {
            #[clap(long, default_value = DEFAULT_DEMO_LOCK)]
            name: String,
        },
    }

    impl Config {
        /// Create new timeout as `Duration`
        pub fn timeout(&self) -> Duration {
            Duration::from_millis(self.timeout_ms)
        }

        pub fn connection_options(&self) -> ConnectionOptions {
            ConnectionOptions::with_timeout(self.timeout())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = Config::try_parse_from(["zkul", "ephemerals", "/app"]).unwrap();
            assert_eq!(config.urls, vec![DEFAULT_URLS.to_string()]);
            assert_eq!(config.timeout(), Duration::from_secs(16));
            assert_eq!(
                config.command,
                Command::Ephemerals {
                    roots: vec!["/app".into()]
                }
            );
        }

        #[test]
        fn test_urls_split_on_comma() {
            let config = Config::try_parse_from([
                "zkul",
                "--urls",
                "zk1:2181,zk2:2181",
                "--timeout-ms",
                "500",
                "lock",
                "/critical/section",
                "--owner",
                "txn-1",
            ])
            .unwrap();
            assert_eq!(config.urls, vec!["zk1:2181", "zk2:2181"]);
            assert_eq!(
                config.connection_options(),
                ConnectionOptions::with_timeout(Duration::from_millis(500))
            );
            assert_eq!(
                config.command,
                Command::Lock {
                    name: "/critical/section".into(),
                    owner: "txn-1".into(),
                    hold_ms: 0,
                }
            );
        }

        #[test]
        fn test_tree_walk_needs_a_root() {
            assert!(Config::try_parse_from(["zkul", "non-ephemerals"]).is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for logging
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Logs go to stderr so stdout stays
        /// parseable JSON.
        pub fn parse(log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(log).or_else(|_| EnvFilter::try_new("info"))?;

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_string(),
            })
        }
    }
}
