//! Join protocol properties against the in-memory channel

use async_trait::async_trait;
use joinrelay::channel::{seed_placeholder, ChannelKey, CoordinationChannel, MemoryChannel};
use joinrelay::common::{retry_until, Attempt, Config, Error, Result, RetryPolicy};
use joinrelay::credential::{is_valid_credential, is_valid_credential_with, JoinCredential};
use joinrelay::node::{CommandOutput, CommandRunner, CommandSpec, Joiner};
use joinrelay::SENTINEL_PLACEHOLDER;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CREDENTIAL_A: &str =
    "join 10.0.1.15:6443 --token aaaaaa.0123456789abcdef --discovery-token-ca-cert-hash sha256:aa";
const CREDENTIAL_B: &str =
    "join 10.0.1.15:6443 --token bbbbbb.0123456789abcdef --discovery-token-ca-cert-hash sha256:bb";

/// Records commands; every command succeeds
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.command_line());
        Ok(CommandOutput::ok(""))
    }
}

/// Serves a scripted sequence of values, one per read; the last repeats
struct SequenceChannel {
    values: Vec<Option<String>>,
    reads: AtomicU32,
}

impl SequenceChannel {
    fn new(values: Vec<Option<&str>>) -> Self {
        Self {
            values: values.into_iter().map(|v| v.map(str::to_string)).collect(),
            reads: AtomicU32::new(0),
        }
    }

    fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationChannel for SequenceChannel {
    async fn read(&self, _key: &ChannelKey) -> Result<Option<String>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(self.values[n.min(self.values.len() - 1)].clone())
    }

    async fn write(&self, _key: &ChannelKey, _value: &str) -> Result<()> {
        Err(Error::Channel("read-only".into()))
    }

    fn describe(&self) -> String {
        "sequence".to_string()
    }
}

fn joiner(channel: Arc<dyn CoordinationChannel>, runner: Arc<RecordingRunner>) -> Joiner {
    let mut config = Config::default();
    config.bootstrap.steps.clear();
    Joiner::new(config, runner, channel).unwrap()
}

fn key() -> ChannelKey {
    ChannelKey::new("joinrelay", "protocol").unwrap()
}

#[test]
fn test_credential_grammar() {
    assert!(!is_valid_credential("placeholder"));
    assert!(!is_valid_credential(""));
    assert!(is_valid_credential(
        "join --token abc.def --discovery-token-ca-cert-hash sha256:1234"
    ));
    assert!(!is_valid_credential("join --token abc.def"));
    assert!(!is_valid_credential(SENTINEL_PLACEHOLDER));
}

#[test]
fn test_placeholder_containing_join_is_rejected() {
    let tricky = "join --token abc.def --discovery-token-ca-cert-hash sha256:1234";
    // configured placeholder that is itself grammar-valid text
    assert!(!is_valid_credential_with(tricky, tricky));
    assert!(!is_valid_credential("PLACEHOLDER join --token later"));
    assert!(!is_valid_credential("not yet: join --token a.b --discovery-token-ca-cert-hash sha256:1"));
}

#[tokio::test]
async fn test_idempotent_read() {
    let channel = MemoryChannel::new();
    channel.write(&key(), CREDENTIAL_A).await.unwrap();

    let first = channel.read(&key()).await.unwrap();
    for _ in 0..10 {
        assert_eq!(channel.read(&key()).await.unwrap(), first);
    }
    assert_eq!(channel.writes(), 1);
}

#[tokio::test]
async fn test_last_write_wins() {
    let channel = MemoryChannel::new();
    channel.write(&key(), CREDENTIAL_A).await.unwrap();
    channel.write(&key(), CREDENTIAL_B).await.unwrap();

    assert_eq!(channel.read(&key()).await.unwrap().as_deref(), Some(CREDENTIAL_B));
}

#[tokio::test]
async fn test_bounded_retry_exactly_five_attempts() {
    let channel = Arc::new(SequenceChannel::new(vec![Some(SENTINEL_PLACEHOLDER)]));
    let runner = Arc::new(RecordingRunner::default());
    let mut joiner = joiner(channel.clone(), runner.clone());

    let err = joiner
        .await_join_credential(&RetryPolicy::fixed(5, Duration::ZERO))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RetriesExhausted { attempts: 5, .. }));
    assert_eq!(channel.reads(), 5);
    assert_eq!(runner.count("kubeadm join"), 0);
}

#[tokio::test]
async fn test_early_success_on_third_attempt() {
    let channel = Arc::new(SequenceChannel::new(vec![
        None,
        Some(SENTINEL_PLACEHOLDER),
        Some(CREDENTIAL_A),
    ]));
    let runner = Arc::new(RecordingRunner::default());
    let mut joiner = joiner(channel.clone(), runner.clone());

    let credential = joiner
        .await_join_credential(&RetryPolicy::fixed(5, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(channel.reads(), 3);

    joiner.join(&credential).await.unwrap();
    assert_eq!(runner.count("kubeadm join 10.0.1.15:6443"), 1);
    // attempts 4 and 5 never happen
    assert_eq!(channel.reads(), 3);
}

#[tokio::test]
async fn test_placeholder_only_never_succeeds() {
    let channel = Arc::new(MemoryChannel::new());
    seed_placeholder(channel.as_ref(), &key(), SENTINEL_PLACEHOLDER)
        .await
        .unwrap();

    let mut config = Config::default();
    config.channel.session_id = "protocol".to_string();
    let runner = Arc::new(RecordingRunner::default());
    let mut joiner = Joiner::new(config, runner, channel.clone()).unwrap();

    let result = joiner
        .await_join_credential(&RetryPolicy::fixed(3, Duration::ZERO))
        .await;
    assert!(result.is_err());
    assert_eq!(channel.reads(), 3);
}

#[tokio::test]
async fn test_retry_combinator_counts_attempts() {
    let seen = AtomicU32::new(0);
    let result = retry_until(&RetryPolicy::fixed(4, Duration::ZERO), "count", |attempt| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 2 {
                Attempt::Ready(attempt)
            } else {
                Attempt::NotReady(format!("attempt {}", attempt))
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_parsed_credential_is_typed() {
    let credential = JoinCredential::parse(
        "kubeadm join 10.0.1.15:6443 --token abc.def \\\n    --discovery-token-ca-cert-hash sha256:1234",
    )
    .unwrap();
    assert_eq!(credential.endpoint(), Some("10.0.1.15:6443"));
    assert_eq!(credential.token().id(), "abc");
    assert_eq!(credential.ca_cert_hashes(), ["sha256:1234"]);
    // secret never shows in debug output
    assert!(!format!("{:?}", credential).contains("def"));
}
