mod common;

use chain_core::Hash;
use chain_dbft::messages::*;
use chain_dbft::*;
use common::*;
use std::sync::Arc;

fn prepare_request(keys: &[chain_core::KeyPair], height: u32, primary: u8, nonce: u64) -> ConsensusPayload {
    sign(
        &keys[primary as usize],
        ConsensusMessage::new(
            MessageHeader::new(height, primary, 0),
            MessageBody::PrepareRequest(PrepareRequest {
                version: 0,
                prev_hash: genesis_hash(),
                timestamp: START_TIME,
                nonce,
                transaction_hashes: vec![Hash::new([0x33; 32])],
            }),
        ),
    )
}

fn prepare_response(keys: &[chain_core::KeyPair], height: u32, index: u8, preparation_hash: Hash) -> ConsensusPayload {
    sign(
        &keys[index as usize],
        ConsensusMessage::new(
            MessageHeader::new(height, index, 0),
            MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
        ),
    )
}

#[test]
fn test_four_validators_finalize_one_block() {
    let mut cluster = Cluster::new(4);
    cluster.start(1);
    cluster.run();

    let expected = cluster.nodes[0].blocks[0].block.hash().unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.blocks.len(), 1);
        let sealed = &node.blocks[0];
        assert_eq!(sealed.block.hash().unwrap(), expected);
        assert!(sealed.verify(NETWORK).unwrap());
        assert_eq!(sealed.block.index(), 1);
        assert_eq!(sealed.block.header.primary_index, 1);
        assert_eq!(sealed.block.header.prev_hash, genesis_hash());
        assert_eq!(sealed.block.transaction_hashes, cluster.transactions);
        assert!(node.timer.is_none());
        assert_eq!(node.engine.round().unwrap().phase(), RoundPhase::BlockFinalized);
    }

    for i in 0..4 {
        assert_eq!(cluster.sent_of_type(i, MessageType::Commit).len(), 1);
        assert!(cluster.sent_of_type(i, MessageType::ChangeView).is_empty());
    }
    assert_eq!(cluster.sent_of_type(1, MessageType::PrepareRequest).len(), 1);
    assert!(cluster.sent_of_type(1, MessageType::PrepareResponse).is_empty());
}

#[test]
fn test_seven_validators_commit_once_and_finalize_once() {
    let keys = keypairs(7);
    let primary = 2u8;
    let mut engine = engine(&keys[primary as usize]);

    let actions = engine.start_round(round_start(100, &keys)).unwrap();
    assert!(actions.contains(&Action::ProduceCandidate { height: 100, view: 0 }));

    let candidate = Candidate {
        transaction_hashes: vec![Hash::new([3u8; 32])],
        timestamp: START_TIME,
        nonce: 1,
    };
    let actions = engine.on_candidate(100, 0, Ok(candidate), START_TIME).unwrap();
    let request = broadcasts(&actions).remove(0);
    assert_eq!(request.message.message_type(), MessageType::PrepareRequest);
    let preparation_hash = request.message.preparation_hash().unwrap();

    let mut commits_sent = 0;
    for index in [0u8, 1, 3, 4, 5] {
        let response = prepare_response(&keys, 100, index, preparation_hash);
        let actions = engine.on_payload(&response.encode(), START_TIME).unwrap();
        commits_sent += of_type(&broadcasts(&actions), MessageType::Commit).len();
    }
    assert_eq!(commits_sent, 1);
    assert_eq!(engine.round().unwrap().phase(), RoundPhase::CommitSent);

    let sign_data = engine
        .round()
        .unwrap()
        .current_proposal()
        .unwrap()
        .sign_data
        .clone();
    let mut blocks = Vec::new();
    for index in [0u8, 1, 3, 4, 5, 6] {
        let signature = keys[index as usize].sign(&sign_data);
        let commit = sign(
            &keys[index as usize],
            ConsensusMessage::new(
                MessageHeader::new(100, index, 0),
                MessageBody::Commit(Commit { signature }),
            ),
        );
        blocks.extend(submitted(&engine.on_payload(&commit.encode(), START_TIME).unwrap()));

        if index == 0 {
            // a repeated commit is not counted twice
            engine.on_payload(&commit.encode(), START_TIME).unwrap();
            assert_eq!(engine.stats().duplicate_payloads, 1);
            assert_eq!(engine.round().unwrap().verified_commit_count(0), 2);
        }
        if index == 4 {
            assert_eq!(blocks.len(), 1);
        }
    }

    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].verify(NETWORK).unwrap());
    assert_eq!(blocks[0].block.header.primary_index, primary);
    assert_eq!(blocks[0].block.index(), 100);
    assert_eq!(engine.stats().blocks_finalized, 1);
}

#[test]
fn test_primary_equivocation_is_recorded() {
    let keys = keypairs(4);
    let mut engine = engine(&keys[0]);
    engine.start_round(round_start(1, &keys)).unwrap();

    let first = prepare_request(&keys, 1, 1, 1);
    let second = prepare_request(&keys, 1, 1, 2);

    let actions = engine.on_payload(&first.encode(), START_TIME).unwrap();
    assert_eq!(of_type(&broadcasts(&actions), MessageType::PrepareResponse).len(), 1);

    let actions = engine.on_payload(&second.encode(), START_TIME).unwrap();
    assert!(broadcasts(&actions).is_empty());

    let first_hash = first.message.preparation_hash().unwrap();
    let violations = engine.violations();
    assert_eq!(violations.count(1, ViolationKind::Equivocation), 1);
    let evidence: Vec<_> = violations.evidence().collect();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].kind, DoubleSignKind::PrepareRequest);
    assert_eq!(evidence[0].first, first_hash);
    assert_eq!(evidence[0].second, second.message.preparation_hash().unwrap());

    let round = engine.round().unwrap();
    assert_eq!(round.current_proposal().unwrap().preparation_hash, first_hash);

    // an exact repeat is only a duplicate
    engine.on_payload(&first.encode(), START_TIME).unwrap();
    assert_eq!(engine.violations().count(1, ViolationKind::Equivocation), 1);
    assert_eq!(engine.stats().duplicate_payloads, 1);
}

#[test]
fn test_prepare_request_from_backup_is_rejected() {
    let keys = keypairs(4);
    let mut engine = engine(&keys[0]);
    engine.start_round(round_start(1, &keys)).unwrap();

    // validator 2 is not primary at height 1 view 0
    let forged = prepare_request(&keys, 1, 2, 1);
    let actions = engine.on_payload(&forged.encode(), START_TIME).unwrap();

    assert!(actions.is_empty());
    assert!(engine.round().unwrap().current_proposal().is_none());
    assert_eq!(engine.violations().count(2, ViolationKind::UnexpectedSender), 1);
}

#[test]
fn test_rejected_proposal_requests_change_view() {
    let keys = keypairs(4);
    let producer = Arc::new(TestProducer::new());
    producer.set_verdict(CandidateVerdict::MissingTransactions);
    let mut engine = engine_with(&keys[0], config(), producer);
    engine.start_round(round_start(1, &keys)).unwrap();

    let actions = engine
        .on_payload(&prepare_request(&keys, 1, 1, 1).encode(), START_TIME)
        .unwrap();
    let sent = broadcasts(&actions);

    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].message.body,
        MessageBody::ChangeView(ChangeView {
            timestamp: START_TIME,
            reason: ChangeViewReason::TransactionNotFound,
        })
    );
    let round = engine.round().unwrap();
    assert!(round.current_proposal().is_none());
    assert!(round.is_view_changing());
}

#[test]
fn test_invalid_proposal_timestamp_is_rejected() {
    let keys = keypairs(4);
    let mut engine = engine(&keys[0]);
    engine.start_round(round_start(1, &keys)).unwrap();

    let request = sign(
        &keys[1],
        ConsensusMessage::new(
            MessageHeader::new(1, 1, 0),
            MessageBody::PrepareRequest(PrepareRequest {
                version: 0,
                prev_hash: genesis_hash(),
                timestamp: GENESIS_TIMESTAMP,
                nonce: 0,
                transaction_hashes: vec![],
            }),
        ),
    );
    let actions = engine.on_payload(&request.encode(), START_TIME).unwrap();

    assert!(actions.is_empty());
    assert_eq!(engine.violations().count(1, ViolationKind::InvalidProposal), 1);
}

#[test]
fn test_early_responses_are_bounded() {
    let keys = keypairs(7);
    let mut engine = engine_with(
        &keys[0],
        config().with_max_buffered_responses(2),
        Arc::new(TestProducer::new()),
    );
    engine.start_round(round_start(1, &keys)).unwrap();

    let request = prepare_request(&keys, 1, 1, 9);
    let hash = request.message.preparation_hash().unwrap();
    for index in [2u8, 3, 4] {
        engine
            .on_payload(&prepare_response(&keys, 1, index, hash).encode(), START_TIME)
            .unwrap();
    }
    assert_eq!(engine.stats().evicted_responses, 1);
    let held: Vec<_> = engine
        .round()
        .unwrap()
        .early_responses()
        .map(|p| p.validator_index())
        .collect();
    assert_eq!(held, vec![3, 4]);

    engine.on_payload(&request.encode(), START_TIME).unwrap();
    let round = engine.round().unwrap();
    let prepared: Vec<_> = round.preparations().keys().copied().collect();
    assert_eq!(prepared, vec![0, 1, 3, 4]);
    assert_eq!(round.early_responses().count(), 0);

    // the evicted sender can still be counted when it repeats itself
    let actions = engine
        .on_payload(&prepare_response(&keys, 1, 2, hash).encode(), START_TIME)
        .unwrap();
    assert_eq!(of_type(&broadcasts(&actions), MessageType::Commit).len(), 1);
}

#[test]
fn test_buffered_response_for_other_proposal_is_dropped() {
    let keys = keypairs(4);
    let mut engine = engine(&keys[0]);
    engine.start_round(round_start(1, &keys)).unwrap();

    let stale = prepare_response(&keys, 1, 2, Hash::new([0xEE; 32]));
    engine.on_payload(&stale.encode(), START_TIME).unwrap();
    engine
        .on_payload(&prepare_request(&keys, 1, 1, 5).encode(), START_TIME)
        .unwrap();

    let prepared: Vec<_> = engine
        .round()
        .unwrap()
        .preparations()
        .keys()
        .copied()
        .collect();
    assert_eq!(prepared, vec![0, 1]);
}

#[test]
fn test_payload_for_other_height_is_stale() {
    let keys = keypairs(4);
    let mut engine = engine(&keys[0]);
    engine.start_round(round_start(5, &keys)).unwrap();

    let actions = engine
        .on_payload(&prepare_request(&keys, 4, 0, 1).encode(), START_TIME)
        .unwrap();

    assert!(actions.is_empty());
    assert_eq!(engine.stats().stale_payloads, 1);
    assert_eq!(engine.violations().total_for(0), 0);
}

#[test]
fn test_watch_only_node_follows_without_signing() {
    let keys = keypairs(5);
    let committee = &keys[..4];
    let mut observer = engine(&keys[4]);
    let actions = observer.start_round(round_start(1, committee)).unwrap();
    assert!(actions.is_empty());

    let mut cluster = Cluster::new(4);
    cluster.start(1);
    cluster.run();

    let mut finalized = Vec::new();
    for node in 0..4 {
        for payload in cluster.nodes[node].sent.clone() {
            let actions = observer.on_payload(&payload.encode(), START_TIME).unwrap();
            assert!(broadcasts(&actions).is_empty());
            finalized.extend(submitted(&actions));
        }
    }

    assert_eq!(finalized.len(), 1);
    assert_eq!(
        finalized[0].block.hash().unwrap(),
        cluster.nodes[0].blocks[0].block.hash().unwrap()
    );
}
