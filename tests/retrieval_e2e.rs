//! Retrieval end to end: relation graph, hybrid search, snapshots and time
//! travel.

use std::collections::{BTreeMap, HashSet};
use std::thread::sleep;
use std::time::Duration;

use chrono::Utc;
use kyromem::entity::{EntityId, EntityKind};
use kyromem::{KyroMem, RequestContext, SearchRequest, SearchType};

fn edge(mem: &KyroMem, ctx: &RequestContext, from: &str, to: &str, kind: &str) {
    mem.write_relation(ctx, from, to, kind, BTreeMap::new(), 0.8).unwrap();
}

#[test]
fn graph_query_walks_chain_up_to_depth() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    edge(&mem, &ctx, "api", "auth", "calls");
    edge(&mem, &ctx, "auth", "users-db", "reads");
    edge(&mem, &ctx, "users-db", "disk", "stored_on");

    let hops = |depth| -> Vec<(String, String)> {
        mem.graph_query("main", "api", None, depth)
            .unwrap()
            .into_iter()
            .map(|e| (e.source, e.target))
            .collect()
    };
    assert!(hops(0).is_empty());
    assert_eq!(hops(1), vec![("api".to_string(), "auth".to_string())]);
    assert_eq!(hops(2).len(), 2);
    assert_eq!(hops(10).len(), 3);

    let only_calls = mem.graph_query("main", "api", Some("calls"), 10).unwrap();
    assert_eq!(only_calls.len(), 1);
    assert!(mem.graph_query("main", "nobody", None, 3).unwrap().is_empty());
}

#[test]
fn graph_query_terminates_on_cycles() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    edge(&mem, &ctx, "a", "b", "next");
    edge(&mem, &ctx, "b", "c", "next");
    edge(&mem, &ctx, "c", "a", "next");

    let edges = mem.graph_query("main", "a", None, 50).unwrap();
    let keys: HashSet<(String, String)> = edges.iter().map(|e| (e.source.clone(), e.target.clone())).collect();
    assert_eq!(edges.len(), 3);
    assert_eq!(keys.len(), 3);
}

#[test]
fn graph_is_branch_scoped() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    mem.create_branch(&ctx, "t1", "main", &[]).unwrap();
    edge(&mem, &ctx.for_branch("t1"), "a", "b", "next");

    assert!(mem.neighbors("main", "a").unwrap().is_empty());
    assert_eq!(mem.neighbors("t1", "a").unwrap().len(), 1);
}

#[test]
fn hybrid_ranks_the_better_match_on_both_channels_first() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    mem.write_fact(&ctx, "rust gardening tips for spring", "misc", 0.5).unwrap();
    let best = mem
        .write_fact(&ctx, "the rust borrow checker rejects aliasing mutation", "lang", 0.9)
        .unwrap();
    mem.write_observation(&ctx, "coffee machine is broken again", "office", None)
        .unwrap();

    let response = mem
        .search(&SearchRequest::new("rust borrow checker", "main"))
        .unwrap();
    assert!(!response.degraded);
    assert_eq!(response.mode, SearchType::Hybrid);
    assert_eq!(response.hits[0].entity.id, best.id);
    assert!(response.hits[0].text_score.is_some());
    assert!(response.hits[0].vector_score.is_some());
    assert!(response.hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn degraded_hybrid_matches_text_order() {
    let mem = KyroMem::in_memory().without_embedder();
    let ctx = RequestContext::main();
    for text in [
        "postgres runs on port 5432",
        "postgres replicas lag under load",
        "redis caches sessions",
        "postgres postgres postgres vacuum",
    ] {
        mem.write_fact(&ctx, text, "infra", 0.6).unwrap();
    }

    let ids = |search_type| -> (Vec<EntityId>, bool) {
        let response = mem
            .search(&SearchRequest::new("postgres", "main").with_type(search_type))
            .unwrap();
        (response.hits.iter().map(|h| h.entity.id).collect(), response.degraded)
    };
    let (text, text_degraded) = ids(SearchType::Text);
    let (hybrid, hybrid_degraded) = ids(SearchType::Hybrid);
    assert!(!text_degraded);
    assert!(hybrid_degraded);
    assert_eq!(text.len(), 3);
    assert_eq!(hybrid, text);
}

#[test]
fn search_skips_relations() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    edge(&mem, &ctx, "kafka", "zookeeper", "depends_on");
    mem.write_fact(&ctx, "kafka needs zookeeper before 3.3", "infra", 0.7).unwrap();

    let response = mem
        .search(&SearchRequest::new("kafka zookeeper", "main").with_type(SearchType::Text))
        .unwrap();
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].entity.kind(), EntityKind::Fact);
}

#[test]
fn time_travel_returns_what_existed_then() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main();
    let a = mem.write_fact(&ctx, "first", "general", 0.5).unwrap();
    let b = mem.write_observation(&ctx, "second", "general", None).unwrap();
    sleep(Duration::from_millis(5));
    let cutoff = Utc::now();
    sleep(Duration::from_millis(5));
    let c = mem.write_fact(&ctx, "third", "general", 0.5).unwrap();

    let then: HashSet<EntityId> = mem
        .time_travel_query(cutoff, "main")
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(then, HashSet::from([a.id, b.id]));

    let now: Vec<EntityId> = mem
        .time_travel_query_kinds(Utc::now(), "main", &[EntityKind::Fact])
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(now, vec![a.id, c.id]);
}

#[test]
fn snapshot_restore_recreates_branch_contents() {
    let mem = KyroMem::in_memory();
    let ctx = RequestContext::main().with_session("s1");
    mem.write_fact(&ctx, "the build uses sccache", "ci", 0.8).unwrap();
    let conv = mem.start_conversation(&ctx, None, Some("ci")).unwrap();
    mem.append_message(&ctx, conv.id, kyromem::MessageRole::User, "is the cache warm", None)
        .unwrap();

    let snapshot = mem.create_snapshot(&ctx, "main", "before-cleanup").unwrap();
    assert_eq!(snapshot.entity_count, 3);
    assert_eq!(mem.list_snapshots("main").unwrap().len(), 1);

    // Later writes are not part of the capture.
    mem.write_fact(&ctx, "sccache was removed", "ci", 0.8).unwrap();

    let restored = mem.restore_snapshot(&ctx, snapshot.id, "restored").unwrap();
    assert_eq!(restored.parent_branch.as_deref(), Some("main"));

    let texts: HashSet<String> = mem
        .time_travel_query(Utc::now(), "restored")
        .unwrap()
        .iter()
        .filter_map(|e| e.text().map(str::to_string))
        .collect();
    assert!(texts.contains("the build uses sccache"));
    assert!(!texts.contains("sccache was removed"));

    let convs = mem
        .time_travel_query_kinds(Utc::now(), "restored", &[EntityKind::Conversation])
        .unwrap();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].origin, Some(conv.id));
    let messages = mem.store().conversation_messages(convs[0].id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].branch_name, "restored");
}
