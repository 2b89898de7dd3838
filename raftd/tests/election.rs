mod common;

use common::*;
use raftd::{ConnectionParameters, RoleKind, StateParameters};
use raftd_api::{
    AppendEntries, AppendEntriesResponse, LogIndex, Message, NodeId, RequestVote,
    RequestVoteResponse, TermId,
};
use std::time::Duration;
use tokio::time::Instant;

fn state(timeout_ms: u64, start_min_ms: u64, start_max_ms: u64) -> StateParameters {
    StateParameters::builder()
        .election_timeout(Duration::from_millis(timeout_ms))
        .election_start_min(Duration::from_millis(start_min_ms))
        .election_start_max(Duration::from_millis(start_max_ms))
        .build()
}

fn connection() -> ConnectionParameters {
    ConnectionParameters::builder()
        .retry(Duration::from_millis(50))
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_follower_becomes_candidate() -> anyhow::Result<()> {
    let start = Instant::now();
    let node = TestNode::new(localhost(0), [], connection(), state(50, 3_600_000, 3_600_000))?;

    assert_eq!(node.status().role, RoleKind::Follower);
    assert_eq!(node.status().term, TermId(0));

    let status = node
        .wait_for_status(|s| s.role == RoleKind::Candidate)
        .await?;
    assert!(Duration::from_millis(50) <= start.elapsed());
    assert_eq!(status.term, TermId(1));
    assert_eq!(status.voted_for, Some(node.id()));

    // persisted before anyone could see it
    let persisted = node.storage().last().expect("persisted");
    assert_eq!(persisted.current_term, TermId(1));
    assert_eq!(persisted.voted_for, Some(node.id()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_candidate_wins_after_election_timeout() -> anyhow::Result<()> {
    let node = TestNode::new(localhost(0), [], connection(), state(50, 10, 10))?;

    let status = node.wait_for_status(|s| s.role == RoleKind::Leader).await?;
    // one term for becoming a candidate, one for the election round
    assert_eq!(status.term, TermId(2));
    assert_eq!(status.voted_for, Some(node.id()));

    // leaders don't do anything on their own yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.status(), status);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn degenerate_start_range_delays_exactly() -> anyhow::Result<()> {
    let node = TestNode::new(localhost(0), [], connection(), state(50, 10, 10))?;

    node.wait_for_status(|s| s.role == RoleKind::Candidate)
        .await?;
    let candidate_at = Instant::now();
    node.wait_for_status(|s| s.term == TermId(2)).await?;

    let delay = candidate_at.elapsed();
    assert!(Duration::from_millis(5) <= delay, "{delay:?}");
    assert!(delay < Duration::from_secs(1), "{delay:?}");

    for _ in 0..100 {
        assert_eq!(
            raftd::random_between(Duration::from_millis(10), Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_elect_a_leader() -> anyhow::Result<()> {
    let a_addr = unused_addr()?;
    let b_addr = unused_addr()?;

    // b would wait forever, a starts an election quickly
    let b = TestNode::new(
        b_addr,
        [a_addr],
        connection(),
        state(3_600_000, 3_600_000, 3_600_000),
    )?;
    let a = TestNode::new(a_addr, [b_addr], connection(), state(100, 10, 20))?;

    wait_until(|| a.ctrl().is_connected(b_addr)).await?;

    let leader = a.wait_for_status(|s| s.role == RoleKind::Leader).await?;
    let follower = b
        .wait_for_status(|s| s.voted_for == Some(a.id()) && s.term == leader.term)
        .await?;
    assert_eq!(follower.role, RoleKind::Follower);
    assert_eq!(leader.voted_for, Some(a.id()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn votes_once_per_term() -> anyhow::Result<()> {
    let node = TestNode::idle([])?;
    let handle = node.node();
    let (x, y) = (NodeId::random(), NodeId::random());

    let request = |candidate_id, term| {
        Message::from(RequestVote {
            term: TermId(term),
            candidate_id,
            last_log_index: LogIndex(0),
            last_log_term: TermId(0),
        })
    };
    let granted = |term, vote_granted| {
        Some(Message::from(RequestVoteResponse {
            term: TermId(term),
            vote_granted,
        }))
    };

    assert_eq!(handle.handle_request(request(x, 5)), granted(5, true));
    // repeating the request is fine
    assert_eq!(handle.handle_request(request(x, 5)), granted(5, true));
    assert_eq!(handle.handle_request(request(y, 5)), granted(5, false));
    // stale term
    assert_eq!(handle.handle_request(request(y, 4)), granted(5, false));
    assert_eq!(node.status().voted_for, Some(x));

    // a new term resets the vote
    assert_eq!(handle.handle_request(request(y, 6)), granted(6, true));
    let status = node.status();
    assert_eq!(status.term, TermId(6));
    assert_eq!(status.voted_for, Some(y));
    assert_eq!(status.role, RoleKind::Follower);
    assert_eq!(node.storage().last().expect("persisted").voted_for, Some(y));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn append_entries_term_checks() -> anyhow::Result<()> {
    let node = TestNode::idle([])?;
    let handle = node.node();
    let leader = NodeId::random();

    let append = |term, entries| {
        Message::from(AppendEntries {
            term: TermId(term),
            leader_id: leader,
            prev_log_index: LogIndex(0),
            entries,
            leader_commit: LogIndex(0),
        })
    };
    let response = |term, success| {
        Some(Message::from(AppendEntriesResponse {
            term: TermId(term),
            success,
        }))
    };

    assert_eq!(handle.handle_request(append(3, vec![])), response(3, true));
    assert_eq!(handle.handle_request(append(2, vec![])), response(3, false));
    assert_eq!(
        handle.handle_request(append(3, vec![Default::default()])),
        response(3, false)
    );
    assert_eq!(node.status().term, TermId(3));
    assert_eq!(node.status().voted_for, None);

    // responses are not expected on incoming links
    assert_eq!(
        handle.handle_request(Message::from(RequestVoteResponse {
            term: TermId(9),
            vote_granted: true,
        })),
        None
    );
    assert_eq!(node.status().term, TermId(3));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn candidate_steps_down_for_current_leader() -> anyhow::Result<()> {
    let node = TestNode::new(localhost(0), [], connection(), state(50, 3_600_000, 3_600_000))?;
    let status = node
        .wait_for_status(|s| s.role == RoleKind::Candidate)
        .await?;

    let response = node.node().handle_request(Message::from(AppendEntries {
        term: status.term,
        leader_id: NodeId::random(),
        prev_log_index: LogIndex(0),
        entries: vec![],
        leader_commit: LogIndex(0),
    }));
    assert_eq!(
        response,
        Some(Message::from(AppendEntriesResponse {
            term: status.term,
            success: true,
        }))
    );

    let status = node.status();
    assert_eq!(status.role, RoleKind::Follower);
    // same term, the vote stays
    assert_eq!(status.term, TermId(1));
    assert_eq!(status.voted_for, Some(node.id()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn higher_term_response_demotes_leader() -> anyhow::Result<()> {
    let node = TestNode::new(localhost(0), [], connection(), state(50, 5, 5))?;
    node.wait_for_status(|s| s.role == RoleKind::Leader).await?;

    node.node().handle_response(
        localhost(1),
        Message::from(AppendEntriesResponse {
            term: TermId(10),
            success: false,
        }),
    );

    let status = node.status();
    assert_eq!(status.role, RoleKind::Follower);
    assert_eq!(status.term, TermId(10));
    assert_eq!(status.voted_for, None);
    Ok(())
}
