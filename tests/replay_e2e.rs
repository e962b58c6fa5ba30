//! Replay, judge scoring and semantic diff through the facade.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use kyromem::entity::EntityId;
use kyromem::{
    DiffStatus, EngineConfig, InMemoryStore, Judge, JudgeError, Judgement, KyroMem, MemError, MessageRole,
    ReplayConfig, ReplayDefaults, RequestContext,
};

/// Rewards longer transcripts: one tenth per turn.
struct TurnCounter;

impl Judge for TurnCounter {
    fn judge(&self, prompt: &str) -> Result<Judgement, JudgeError> {
        let turns = prompt.lines().filter(|l| l.starts_with('[')).count();
        #[allow(clippy::cast_precision_loss)]
        let score = (turns as f32 / 10.0).min(1.0);
        Ok(Judgement {
            score,
            rationale: format!("{turns} turns"),
        })
    }
}

struct Sleepy;

impl Judge for Sleepy {
    fn judge(&self, _prompt: &str) -> Result<Judgement, JudgeError> {
        sleep(Duration::from_millis(500));
        Ok(Judgement {
            score: 1.0,
            rationale: String::new(),
        })
    }
}

fn seed(mem: &KyroMem) -> EntityId {
    let ctx = RequestContext::main().with_session("s1");
    mem.write_fact(&ctx, "the deploy target is staging", "ops", 0.9).unwrap();
    let conv = mem.start_conversation(&ctx, None, Some("deploys")).unwrap();
    for (role, content) in [
        (MessageRole::System, "you are a release assistant"),
        (MessageRole::User, "where do we deploy"),
        (MessageRole::Assistant, "staging"),
    ] {
        mem.append_message(&ctx, conv.id, role, content, None).unwrap();
    }
    conv.id
}

#[test]
fn replay_orders_turns_and_grounds_user_messages() {
    let mem = KyroMem::in_memory();
    let conv = seed(&mem);

    let plain = mem.replay(conv, &ReplayConfig::default()).unwrap();
    assert_eq!(plain.title.as_deref(), Some("deploys"));
    assert_eq!(plain.branch, "main");
    let sequences: Vec<u32> = plain.turns.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert!(plain.turns.iter().all(|t| t.grounding.is_empty()));

    let grounded = mem.replay(conv, &ReplayConfig::default().reground_on("main")).unwrap();
    let user = &grounded.turns[1];
    assert_eq!(user.role, MessageRole::User);
    assert_eq!(user.grounding.len(), 1);
    assert_eq!(user.grounding[0].text, "the deploy target is staging");
    assert!(grounded.turns[2].grounding.is_empty());
    assert!(grounded.render().contains("    (fact) the deploy target is staging"));

    let only_user = mem
        .replay(conv, &ReplayConfig::default().only_roles(&[MessageRole::User]))
        .unwrap();
    assert_eq!(only_user.turns.len(), 1);

    let capped = mem.replay(conv, &ReplayConfig::default().limit(2)).unwrap();
    assert_eq!(capped.turns.len(), 2);
}

#[test]
fn replay_errors() {
    let mem = KyroMem::in_memory();
    let conv = seed(&mem);
    assert!(matches!(
        mem.replay(EntityId::new(), &ReplayConfig::default()).unwrap_err(),
        MemError::EntityNotFound { .. }
    ));
    assert!(matches!(
        mem.replay(conv, &ReplayConfig::default().reground_on("ghost")).unwrap_err(),
        MemError::BranchNotFound(_)
    ));
}

#[test]
fn score_and_compare_with_injected_judge() {
    let mem = KyroMem::in_memory().with_judge(Arc::new(TurnCounter));
    let conv = seed(&mem);
    let ctx = RequestContext::main().with_session("s1");

    let baseline = mem.replay(conv, &ReplayConfig::default()).unwrap();
    let judgement = mem.score(&baseline, Some("staging")).unwrap();
    assert!((judgement.score - 0.3).abs() < 1e-6);

    mem.append_message(&ctx, conv, MessageRole::User, "thanks", None).unwrap();
    let candidate = mem.replay(conv, &ReplayConfig::default()).unwrap();
    let comparison = mem.compare(&baseline, &candidate, None).unwrap();
    assert!(comparison.improved());
    assert!((comparison.delta - 0.1).abs() < 1e-6);
}

#[test]
fn slow_judge_times_out() {
    let config = EngineConfig {
        replay: ReplayDefaults {
            judge_timeout_ms: Some(20),
            ..ReplayDefaults::default()
        },
        ..EngineConfig::default()
    };
    let mem = KyroMem::with_config(Arc::new(InMemoryStore::new()), config)
        .unwrap()
        .with_judge(Arc::new(Sleepy));
    let conv = seed(&mem);
    let transcript = mem.replay(conv, &ReplayConfig::default()).unwrap();

    let err = mem.score(&transcript, None).unwrap_err();
    assert!(matches!(err, MemError::Judge(JudgeError::Timeout { duration_ms: 20 })));
    assert!(err.is_retryable());
}

#[test]
fn diff_transcripts_across_branches() {
    let mem = KyroMem::in_memory();
    let conv = seed(&mem);
    let main = RequestContext::main().with_session("s1");
    mem.create_branch(&main, "retry", "main", &[]).unwrap();

    let picked = mem.cherry_pick_conversation(&main, conv, "retry").unwrap();
    let retry = main.for_branch("retry");
    mem.append_message(&retry, picked.conversation.id, MessageRole::User, "and production?", None)
        .unwrap();

    let a = mem.replay(conv, &ReplayConfig::default()).unwrap();
    let b = mem.replay(picked.conversation.id, &ReplayConfig::default()).unwrap();
    assert_eq!(b.branch, "retry");

    let diff = mem.diff_transcripts(&a, &b);
    assert_eq!(diff.count(DiffStatus::Identical), 3);
    assert_eq!(diff.count(DiffStatus::Added), 1);
    assert_eq!(diff.count(DiffStatus::Removed), 0);
    assert!(!diff.is_unchanged());

    let same = mem.diff_transcripts(&a, &a);
    assert!(same.is_unchanged());
}
