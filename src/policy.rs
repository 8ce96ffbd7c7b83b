//! Command Policies
//!
//! Plain structs with sensible defaults. The dispatcher only reads them.

use std::time::{Duration, Instant};

/// Which copy of a partition a read goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replica {
    /// Always the master.
    Master,
    /// Alternate between master and prole across all commands.
    Any,
    /// Master first, then prole on each retry.
    #[default]
    Sequence,
    /// A copy on the client's rack when one exists, otherwise `Sequence`.
    PreferRack,
}

/// Consistency of reads in AP namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadModeAp {
    #[default]
    One,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitLevel {
    #[default]
    All,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationPolicy {
    #[default]
    None,
    ExpectEqual,
    ExpectGreater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordExists {
    #[default]
    Update,
    UpdateOnly,
    Replace,
    ReplaceOnly,
    CreateOnly,
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct BasePolicy {
    /// Idle limit for a single socket operation. Zero disables it.
    pub socket_timeout: Duration,
    /// Deadline for the whole command including retries. Zero disables it.
    pub total_timeout: Duration,
    pub max_retries: u32,
    pub sleep_between_retries: Duration,
    /// Requests larger than this are zlib compressed. Zero disables it.
    pub compression_threshold: usize,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_millis(1000),
            max_retries: 2,
            sleep_between_retries: Duration::ZERO,
            compression_threshold: 0,
        }
    }
}

impl BasePolicy {
    pub fn deadline(&self) -> Option<Instant> {
        if self.total_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.total_timeout)
        }
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        if self.socket_timeout.is_zero() {
            None
        } else {
            Some(self.socket_timeout)
        }
    }

    /// Timeout sent to the server in the message header, in milliseconds.
    pub(crate) fn server_timeout_ms(&self) -> u32 {
        let timeout = if self.total_timeout.is_zero() {
            self.socket_timeout
        } else {
            self.total_timeout
        };
        timeout.as_millis().min(u32::MAX as u128) as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadPolicy {
    pub base: BasePolicy,
    pub replica: Replica,
    pub read_mode_ap: ReadModeAp,
}

#[derive(Debug, Clone)]
pub struct WritePolicy {
    pub base: BasePolicy,
    pub replica: Replica,
    pub commit_level: CommitLevel,
    pub generation_policy: GenerationPolicy,
    pub generation: u32,
    /// Record time to live in seconds. 0 means the namespace default.
    pub expiration: u32,
    pub record_exists: RecordExists,
    /// Store the user key alongside the record.
    pub send_key: bool,
    pub durable_delete: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                max_retries: 0,
                ..BasePolicy::default()
            },
            replica: Replica::Sequence,
            commit_level: CommitLevel::All,
            generation_policy: GenerationPolicy::None,
            generation: 0,
            expiration: 0,
            record_exists: RecordExists::Update,
            send_key: false,
            durable_delete: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchPolicy {
    pub base: BasePolicy,
    pub replica: Replica,
    pub read_mode_ap: ReadModeAp,
}

#[derive(Debug, Clone)]
pub struct InfoPolicy {
    pub timeout: Duration,
}

impl Default for InfoPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeouts_disable_deadlines() {
        let policy = BasePolicy {
            socket_timeout: Duration::ZERO,
            total_timeout: Duration::ZERO,
            ..BasePolicy::default()
        };
        assert!(policy.deadline().is_none());
        assert!(policy.socket_timeout().is_none());
        assert_eq!(policy.server_timeout_ms(), 0);
    }

    #[test]
    fn test_writes_do_not_retry_by_default() {
        assert_eq!(WritePolicy::default().base.max_retries, 0);
        assert_eq!(ReadPolicy::default().base.max_retries, 2);
    }
}
