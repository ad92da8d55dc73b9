//! Property sweeps over the pure pipeline stages
//!
//! Deterministic pseudo-random inputs; each case checks an invariant that
//! must hold for every input rather than a single expected value.

use chrono::{Duration, Utc};
use uuid::Uuid;

use tenderwatch::adapters::ScriptedCompletionEngine;
use tenderwatch::core::hasher::procurement_content_hash;
use tenderwatch::core::{allocate, select, BudgetPlan, Extractor, RankedCandidate, RetryPolicy};
use tenderwatch::domain::{AnalysisRecord, AnalysisStatus, ExclusionReason, FileCandidate};

/// Small linear congruential generator, enough to vary the inputs
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn random_candidates(rng: &mut Lcg, count: usize) -> Vec<RankedCandidate> {
    (0..count)
        .map(|i| RankedCandidate {
            analysis_id: Uuid::new_v4(),
            control_number: format!("CN-{:03}", i),
            version_number: 1,
            region: format!("R{}", rng.below(4)),
            priority: rng.below(200) as i64 - 50,
            votes: if rng.below(3) == 0 { 0 } else { rng.below(20) as i64 },
            estimated_cost: (rng.below(5_000) as f64) / 100.0,
        })
        .collect()
}

#[test]
fn test_allocation_never_overspends() {
    let mut rng = Lcg(7);
    for case in 0..200 {
        let count = 1 + rng.below(30) as usize;
        let candidates = random_candidates(&mut rng, count);
        let plan = BudgetPlan {
            budget: rng.below(20_000) as f64 / 100.0,
            zero_vote_percent: rng.below(101) as f64,
            max_messages: if case % 3 == 0 { Some(1 + rng.below(10) as usize) } else { None },
        };

        let allocation = allocate(candidates, &plan);
        let spent: f64 = allocation.chosen.iter().map(|c| c.estimated_cost).sum();
        let zero_vote: f64 = allocation
            .chosen
            .iter()
            .filter(|c| c.votes == 0)
            .map(|c| c.estimated_cost)
            .sum();

        assert!(spent <= plan.budget + 1e-9, "case {}: spent {} > {}", case, spent, plan.budget);
        assert!(
            zero_vote <= plan.zero_vote_budget() + 1e-9,
            "case {}: zero-vote spend {} > {}",
            case,
            zero_vote,
            plan.zero_vote_budget()
        );
        if let Some(max) = plan.max_messages {
            assert!(allocation.chosen.len() <= max);
        }
        assert!((allocation.spent - spent).abs() < 1e-6);
    }
}

#[test]
fn test_selection_stays_under_ceiling() {
    let mut rng = Lcg(11);
    for case in 0..50 {
        let prompt_tokens = rng.below(500);
        let engine = ScriptedCompletionEngine::new().with_prompt_tokens(prompt_tokens);
        let candidates: Vec<FileCandidate> = (0..1 + rng.below(8))
            .map(|i| {
                let mut c = FileCandidate::new("doc", format!("f{}.pdf", i), Vec::new(), 0);
                c.ai_uris = vec![format!("mem://normalized/f{}.pdf?tokens={}", i, 1 + rng.below(4_000))];
                c
            })
            .collect();
        let ceiling = rng.below(10_000);

        let selection = tokio_test::block_on(select(candidates, "prompt", ceiling, &engine)).unwrap();

        let included: u64 = selection
            .included()
            .flat_map(|c| c.ai_uris.iter())
            .map(|uri| uri.rsplit_once("tokens=").unwrap().1.parse::<u64>().unwrap())
            .sum();
        if selection.included().count() > 0 {
            assert!(prompt_tokens + included <= ceiling, "case {}", case);
            assert_eq!(selection.input_tokens, prompt_tokens + included);
        }
        for candidate in selection.candidates.iter().filter(|c| !c.is_included()) {
            assert_eq!(candidate.exclusion_reason(), Some(ExclusionReason::TokenLimitExceeded));
        }
    }
}

#[test]
fn test_retry_never_exceeds_max_retries() {
    let now = Utc::now();
    let policy = RetryPolicy {
        initial_backoff_hours: 3,
        max_retries: 4,
        timeout_hours: 1,
    };

    for retry_count in 0..8u32 {
        for hours_ago in [0i64, 2, 3, 5, 6, 11, 12, 24, 47, 48, 1000] {
            let mut record = AnalysisRecord::new("CN", 1);
            record.status = AnalysisStatus::AnalysisFailed;
            record.retry_count = retry_count;
            record.updated_at = now - Duration::hours(hours_ago);

            let planned = policy.plan(&record, now).is_some();
            let backoff_hours = 3 * 2i64.pow(retry_count);
            let expected = retry_count < policy.max_retries && hours_ago >= backoff_hours;
            assert_eq!(planned, expected, "retry_count {} hours_ago {}", retry_count, hours_ago);
        }
    }
}

#[test]
fn test_content_hash_ignores_file_order() {
    let raw = serde_json::json!({ "numeroControlePNCP": "CN", "objetoCompra": "x" });
    let files = vec![
        ("d1/a.pdf".to_string(), b"alpha".to_vec()),
        ("d1/b.pdf".to_string(), b"beta".to_vec()),
        ("d2/c.txt".to_string(), b"gamma".to_vec()),
    ];
    let mut reversed = files.clone();
    reversed.reverse();

    let base = procurement_content_hash(&raw, &[], &files);
    assert_eq!(base, procurement_content_hash(&raw, &[], &reversed));

    let mut edited = files.clone();
    edited[1].1 = b"beta!".to_vec();
    assert_ne!(base, procurement_content_hash(&raw, &[], &edited));

    let changed = serde_json::json!({ "numeroControlePNCP": "CN", "objetoCompra": "y" });
    assert_ne!(base, procurement_content_hash(&changed, &[], &files));
}

#[test]
fn test_garbage_never_escapes_extraction() {
    let extractor = Extractor::default();
    let mut rng = Lcg(3);
    for name in ["a.zip", "b.rar", "c.7z", "d.tar.gz", "e.tgz", "f.bin"] {
        for _ in 0..5 {
            let len = 16 + rng.below(240) as usize;
            let mut bytes: Vec<u8> = (0..len).map(|_| rng.below(256) as u8).collect();
            if name.ends_with(".zip") && bytes.len() >= 4 {
                bytes[..4].copy_from_slice(b"PK\x03\x04");
            }

            let leaves = extractor.extract(name, bytes.clone());
            assert_eq!(leaves.len(), 1, "{} should degrade to one leaf", name);
            assert_eq!(leaves[0].content, bytes);
        }
    }
}
