/// Typing indicators
/// Purely local, never reconciled against the server. Every label expires
/// after the quiet period unless renewed; absence is the default.
use feed_model::{PostId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::{ClientSignal, TypingSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalTyping {
    Idle,
    Typing {
        context: PostId,
        deadline: Instant,
        announced_at: Instant,
    },
}

pub struct TypingTracker {
    own_id: UserId,
    own_label: String,
    quiet_period: Duration,
    local: LocalTyping,
    remote: HashMap<PostId, BTreeMap<String, Instant>>,
}

impl TypingTracker {
    pub fn new(own_id: UserId, own_label: impl Into<String>, quiet_period: Duration) -> Self {
        Self {
            own_id,
            own_label: own_label.into(),
            quiet_period,
            local: LocalTyping::Idle,
            remote: HashMap::new(),
        }
    }

    /// Keystroke in the comment box of `context`. The Idle to Typing
    /// transition is announced; later keystrokes push the deadline out and
    /// re-announce once half a quiet period has passed, so receivers whose
    /// labels expire after one quiet period keep showing us.
    pub fn start_typing(&mut self, context: &PostId) -> Vec<ClientSignal> {
        let mut signals = Vec::new();
        let now = Instant::now();
        let deadline = now + self.quiet_period;
        let renewal = self.quiet_period / 2;

        if let LocalTyping::Typing {
            context: current,
            deadline: current_deadline,
            announced_at,
        } = &mut self.local
        {
            if current == context {
                *current_deadline = deadline;
                if now.duration_since(*announced_at) < renewal {
                    return signals;
                }
                *announced_at = now;
                signals.push(ClientSignal::Typing(self.signal_for(context)));
                return signals;
            }
        }
        // Moved to another post's comment box.
        signals.extend(self.stop_typing());

        self.local = LocalTyping::Typing {
            context: context.clone(),
            deadline,
            announced_at: now,
        };
        signals.push(ClientSignal::Typing(self.signal_for(context)));
        signals
    }

    /// Submit, clear or explicit stop.
    pub fn stop_typing(&mut self) -> Option<ClientSignal> {
        match std::mem::replace(&mut self.local, LocalTyping::Idle) {
            LocalTyping::Typing { context, .. } => {
                Some(ClientSignal::StopTyping(self.signal_for(&context)))
            }
            LocalTyping::Idle => None,
        }
    }

    /// Comment input changed: empty input counts as a stop.
    pub fn input_changed(&mut self, context: &PostId, text: &str) -> Vec<ClientSignal> {
        if text.trim().is_empty() {
            return self.stop_typing().into_iter().collect();
        }
        self.start_typing(context)
    }

    /// Inbound presence from another actor. Our own label is ignored.
    pub fn observe(&mut self, signal: &TypingSignal, typing: bool) -> bool {
        if signal.display_name == self.own_label || signal.user_id.as_ref() == Some(&self.own_id) {
            return false;
        }

        if typing {
            let expires_at = Instant::now() + self.quiet_period;
            self.remote
                .entry(signal.post_id.clone())
                .or_default()
                .insert(signal.display_name.clone(), expires_at);
            true
        } else {
            let Some(labels) = self.remote.get_mut(&signal.post_id) else {
                return false;
            };
            let removed = labels.remove(&signal.display_name).is_some();
            if labels.is_empty() {
                self.remote.remove(&signal.post_id);
            }
            removed
        }
    }

    /// Expire everything past its deadline. Returns the stop signal to send
    /// when the local quiet period ran out.
    pub fn sweep(&mut self, now: Instant) -> Option<ClientSignal> {
        self.remote.retain(|context, labels| {
            labels.retain(|label, expires_at| {
                let alive = *expires_at > now;
                if !alive {
                    debug!("Typing indicator for {} on {} expired", label, context);
                }
                alive
            });
            !labels.is_empty()
        });

        let expired = matches!(&self.local, LocalTyping::Typing { deadline, .. } if *deadline <= now);
        if expired {
            self.stop_typing()
        } else {
            None
        }
    }

    /// Labels currently typing in `context`, sorted. Labels past their
    /// deadline are hidden even before the next sweep drops them.
    pub fn typing_labels(&self, context: &PostId) -> Vec<String> {
        let now = Instant::now();
        self.remote
            .get(context)
            .map(|labels| {
                labels
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(label, _)| label.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.local, LocalTyping::Typing { .. })
    }

    pub fn typing_context(&self) -> Option<&PostId> {
        match &self.local {
            LocalTyping::Typing { context, .. } => Some(context),
            LocalTyping::Idle => None,
        }
    }

    pub fn clear(&mut self) {
        self.local = LocalTyping::Idle;
        self.remote.clear();
    }

    fn signal_for(&self, context: &PostId) -> TypingSignal {
        TypingSignal {
            post_id: context.clone(),
            display_name: self.own_label.clone(),
            user_id: Some(self.own_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_secs(2);

    fn tracker() -> TypingTracker {
        TypingTracker::new(UserId::from("me"), "Me", QUIET)
    }

    fn remote(label: &str) -> TypingSignal {
        TypingSignal {
            post_id: PostId::from("p1"),
            display_name: label.to_string(),
            user_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_keystroke_is_announced() {
        let mut typing = tracker();
        let post = PostId::from("p1");

        let first = typing.start_typing(&post);
        assert!(matches!(first.as_slice(), [ClientSignal::Typing(_)]));
        assert!(typing.start_typing(&post).is_empty());
        assert!(typing.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_emits_stop() {
        let mut typing = tracker();
        let post = PostId::from("p1");
        typing.start_typing(&post);

        tokio::time::advance(Duration::from_millis(1500)).await;
        typing.start_typing(&post);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(typing.sweep(Instant::now()), None);

        tokio::time::advance(Duration::from_millis(500)).await;
        let stop = typing.sweep(Instant::now());
        assert!(matches!(stop, Some(ClientSignal::StopTyping(_))));
        assert!(!typing.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_stops() {
        let mut typing = tracker();
        let post = PostId::from("p1");
        typing.input_changed(&post, "h");
        let signals = typing.input_changed(&post, "   ");
        assert!(matches!(signals.as_slice(), [ClientSignal::StopTyping(_)]));
        assert!(typing.input_changed(&post, "").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_context_stops_previous() {
        let mut typing = tracker();
        typing.start_typing(&PostId::from("p1"));
        let signals = typing.start_typing(&PostId::from("p2"));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal().post_id, PostId::from("p1"));
        assert!(matches!(signals[1], ClientSignal::Typing(_)));
        assert_eq!(typing.typing_context(), Some(&PostId::from("p2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_label_expires() {
        let mut typing = tracker();
        assert!(typing.observe(&remote("Ann"), true));
        assert_eq!(typing.typing_labels(&PostId::from("p1")), vec!["Ann"]);

        tokio::time::advance(QUIET).await;
        typing.sweep(Instant::now());
        assert!(typing.typing_labels(&PostId::from("p1")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_stop_and_own_label() {
        let mut typing = tracker();
        typing.observe(&remote("Ann"), true);
        typing.observe(&remote("Bo"), true);
        assert!(!typing.observe(&remote("Me"), true));

        assert!(typing.observe(&remote("Ann"), false));
        assert_eq!(typing.typing_labels(&PostId::from("p1")), vec!["Bo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_typing_stays_visible_to_receivers() {
        let mut sender = tracker();
        let mut receiver = TypingTracker::new(UserId::from("ann"), "Ann", QUIET);
        let post = PostId::from("p1");

        // One keystroke every 500ms for 3s, delivering whatever goes out.
        for _ in 0..=6 {
            for signal in sender.start_typing(&post) {
                if let ClientSignal::Typing(typing) = &signal {
                    receiver.observe(typing, true);
                }
            }
            receiver.sweep(Instant::now());
            assert_eq!(receiver.typing_labels(&post), vec!["Me"]);
            tokio::time::advance(Duration::from_millis(500)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_renew_after_half_quiet_period() {
        let mut typing = tracker();
        let post = PostId::from("p1");
        typing.start_typing(&post);

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(typing.start_typing(&post).is_empty());
        tokio::time::advance(Duration::from_millis(100)).await;
        let renewed = typing.start_typing(&post);
        assert!(matches!(renewed.as_slice(), [ClientSignal::Typing(_)]));
        assert!(typing.start_typing(&post).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_label_hidden_without_sweep() {
        let mut typing = tracker();
        typing.observe(&remote("Ann"), true);

        tokio::time::advance(QUIET).await;
        assert!(typing.typing_labels(&PostId::from("p1")).is_empty());
    }
}
