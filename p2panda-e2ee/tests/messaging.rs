// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_matches::assert_matches;
use p2panda_e2ee::test_utils::{TestCodec, TestNetwork};
use p2panda_e2ee::traits::ShareMailbox;
use p2panda_e2ee::{
    CodecError, Config, ConversationId, DecryptionFailure, DeviceAddress, DistributionError,
    Envelope, ErrorClass, PrekeyDirectoryError, SendOutcome, Topology, Trust, VerificationMethod,
};

async fn send(
    codec: &mut TestCodec,
    conversation_id: &ConversationId,
    plaintext: &[u8],
    topology: &Topology,
) -> (Envelope, usize) {
    match codec.send(conversation_id, plaintext, topology).await.unwrap() {
        SendOutcome::Encrypted {
            envelope,
            distribution,
        } => {
            assert!(distribution.iter().all(|outcome| outcome.is_ok()));

            // Travel over the wire.
            let bytes = envelope.to_bytes().unwrap();
            (Envelope::from_bytes(&bytes).unwrap(), distribution.len())
        }
        SendOutcome::Unencrypted { .. } => panic!("message was not encrypted"),
    }
}

fn envelope_entries(envelope: &Envelope) -> Vec<(ciborium::Value, ciborium::Value)> {
    let value: ciborium::Value = ciborium::from_reader(&envelope.to_bytes().unwrap()[..]).unwrap();
    match value {
        ciborium::Value::Map(entries) => entries,
        _ => panic!("envelope is not a map"),
    }
}

fn envelope_from_entries(entries: Vec<(ciborium::Value, ciborium::Value)>) -> Envelope {
    let mut bytes = Vec::new();
    ciborium::into_writer(&ciborium::Value::Map(entries), &mut bytes).unwrap();
    Envelope::from_bytes(&bytes).unwrap()
}

fn has_entry(entries: &[(ciborium::Value, ciborium::Value)], name: &str) -> bool {
    entries.iter().any(|(key, _)| key.as_text() == Some(name))
}

#[tokio::test]
async fn group_conversation() {
    let network = TestNetwork::new(Config::default());
    let mut xavier = network.join("xavier", "laptop", 1).await;
    let mut yasmin = network.join("yasmin", "phone", 2).await;
    let mut zoe = network.join("zoe", "tablet", 3).await;
    let xavier_address = xavier.address().clone();

    let conversation_id = ConversationId::new("garden-club");
    let mut members = vec![
        xavier_address.clone(),
        yasmin.address().clone(),
        zoe.address().clone(),
    ];
    let topology = Topology::Group {
        members: members.clone(),
    };

    // Xavier creates a group session and shares it with Yasmin and Zoe.
    let (first, distributed) =
        send(&mut xavier, &conversation_id, b"Hello, Garden!", &topology).await;
    assert_eq!(distributed, 2);
    assert_eq!(first.message_index(), Some(0));

    // The share wasn't claimed yet.
    assert_eq!(
        yasmin.receive(&conversation_id, &first).await,
        Err(DecryptionFailure::SessionUnavailable)
    );

    for member in [&mut yasmin, &mut zoe] {
        let report = member.claim_pending().await.unwrap();
        assert_eq!(report.imported, vec![first.session_id()]);
        assert!(report.skipped.is_empty());

        let received = member.receive(&conversation_id, &first).await.unwrap();
        assert_eq!(received.plaintext, b"Hello, Garden!");
        assert_eq!(received.sender, xavier_address);
        assert_eq!(received.trust, Trust::Unverified);

        // Every group message decrypts once.
        assert_eq!(
            member.receive(&conversation_id, &first).await,
            Err(DecryptionFailure::SessionUnavailable)
        );

        // Shares are gone from the mailbox.
        let report = member.claim_pending().await.unwrap();
        assert!(report.imported.is_empty());
    }

    // Our own messages come back to us.
    let own = xavier.receive(&conversation_id, &first).await.unwrap();
    assert_eq!(own.plaintext, b"Hello, Garden!");

    // Same members, same session.
    let (second, distributed) =
        send(&mut xavier, &conversation_id, b"Tomatoes?", &topology).await;
    assert_eq!(distributed, 0);
    assert_eq!(second.session_id(), first.session_id());
    assert_eq!(second.message_index(), Some(1));
    for member in [&mut yasmin, &mut zoe] {
        let received = member.receive(&conversation_id, &second).await.unwrap();
        assert_eq!(received.plaintext, b"Tomatoes?");
    }

    // Yasmin answers with her own session, which reuses the pairwise session with Xavier.
    let (answer, distributed) = send(&mut yasmin, &conversation_id, b"Yes!", &topology).await;
    assert_eq!(distributed, 2);
    assert_ne!(answer.session_id(), first.session_id());
    for member in [&mut xavier, &mut zoe] {
        member.claim_pending().await.unwrap();
        let received = member.receive(&conversation_id, &answer).await.unwrap();
        assert_eq!(received.plaintext, b"Yes!");
    }

    // Walter joins late: a new session is created and he can't read anything before.
    let mut walter = network.join("walter", "desktop", 4).await;
    members.push(walter.address().clone());
    let topology = Topology::Group {
        members: members.clone(),
    };

    let (third, distributed) =
        send(&mut xavier, &conversation_id, b"Welcome, Walter", &topology).await;
    assert_eq!(distributed, 3);
    assert_ne!(third.session_id(), first.session_id());

    walter.claim_pending().await.unwrap();
    let received = walter.receive(&conversation_id, &third).await.unwrap();
    assert_eq!(received.plaintext, b"Welcome, Walter");
    assert_eq!(
        walter.receive(&conversation_id, &first).await,
        Err(DecryptionFailure::SessionUnavailable)
    );
    for member in [&mut yasmin, &mut zoe] {
        member.claim_pending().await.unwrap();
        let received = member.receive(&conversation_id, &third).await.unwrap();
        assert_eq!(received.plaintext, b"Welcome, Walter");
    }

    // Messages of one conversation can't be replayed into another.
    assert_eq!(
        yasmin.receive(&ConversationId::new("other"), &third).await,
        Err(DecryptionFailure::Undecryptable)
    );
}

#[tokio::test]
async fn reshare_starts_at_current_index() {
    let network = TestNetwork::new(Config::default());
    let mut xavier = network.join("xavier", "laptop", 1).await;
    let mut yasmin = network.join("yasmin", "phone", 2).await;
    let mut walter = network.join("walter", "desktop", 3).await;
    let walter_address = walter.address().clone();

    let conversation_id = ConversationId::new("garden-club");
    let topology = Topology::Group {
        members: vec![
            xavier.address().clone(),
            yasmin.address().clone(),
        ],
    };

    let (first, _) = send(&mut xavier, &conversation_id, b"one", &topology).await;
    let (second, _) = send(&mut xavier, &conversation_id, b"two", &topology).await;

    let outcomes = xavier
        .reshare(&conversation_id, &[walter_address.clone()])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].device, walter_address);
    assert!(outcomes[0].is_ok());

    walter.claim_pending().await.unwrap();
    let inbound = walter.inbound_group_session(&first.session_id()).unwrap();
    assert_eq!(inbound.first_known_index, 2);
    assert_eq!(inbound.sender, *xavier.address());
    assert_eq!(inbound.conversation_id, conversation_id);

    for envelope in [&first, &second] {
        assert_eq!(
            walter.receive(&conversation_id, envelope).await,
            Err(DecryptionFailure::SessionUnavailable)
        );
    }

    let (third, _) = send(&mut xavier, &conversation_id, b"three", &topology).await;
    let received = walter.receive(&conversation_id, &third).await.unwrap();
    assert_eq!(received.plaintext, b"three");

    yasmin.claim_pending().await.unwrap();
    for (envelope, plaintext) in [(&first, b"one"), (&second, b"two")] {
        let received = yasmin.receive(&conversation_id, envelope).await.unwrap();
        assert_eq!(&received.plaintext, plaintext);
    }

    assert_matches!(
        xavier
            .reshare(&ConversationId::new("unknown"), &[walter_address])
            .await,
        Err(CodecError::NoGroupSession(_))
    );
}

#[tokio::test]
async fn pairwise_conversation() {
    let network = TestNetwork::new(Config::default());
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut bob = network.join("bob", "phone", 2).await;
    let alice_address = alice.address().clone();
    let bob_address = bob.address().clone();

    let conversation_id = ConversationId::new("alice-bob");
    let to_bob = Topology::Pairwise {
        peer: bob_address.clone(),
    };
    let to_alice = Topology::Pairwise {
        peer: alice_address.clone(),
    };

    let mut envelopes = Vec::new();
    for plaintext in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let (envelope, _) = send(&mut alice, &conversation_id, plaintext, &to_bob).await;
        envelopes.push(envelope);
    }
    assert!(envelopes.iter().all(|envelope| envelope.message_index().is_none()));

    // Out of order delivery.
    for (i, plaintext) in [(2, &b"three"[..]), (0, &b"one"[..]), (1, &b"two"[..])] {
        let received = bob.receive(&conversation_id, &envelopes[i]).await.unwrap();
        assert_eq!(received.plaintext, plaintext);
        assert_eq!(received.sender, alice_address);
        assert_eq!(received.trust, Trust::Unverified);
    }

    // Replays are rejected.
    assert_eq!(
        bob.receive(&conversation_id, &envelopes[0]).await,
        Err(DecryptionFailure::SessionUnavailable)
    );

    let (reply, _) = send(&mut bob, &conversation_id, b"hi alice", &to_alice).await;
    let received = alice.receive(&conversation_id, &reply).await.unwrap();
    assert_eq!(received.plaintext, b"hi alice");

    // Trust follows the device registry.
    alice
        .devices_mut()
        .mark_administratively_verified(&bob_address)
        .unwrap();
    let (reply, _) = send(&mut bob, &conversation_id, b"verified?", &to_alice).await;
    let received = alice.receive(&conversation_id, &reply).await.unwrap();
    assert_eq!(
        received.trust,
        Trust::Verified(VerificationMethod::Administrative)
    );
}

#[tokio::test]
async fn missing_key_material() {
    let network = TestNetwork::new(Config::default());
    let mut alice = network.join("alice", "laptop", 1).await;
    let conversation_id = ConversationId::new("nobody-home");
    let stranger = DeviceAddress::new("stranger", "unknown");

    assert_matches!(
        alice
            .send(
                &conversation_id,
                b"hello?",
                &Topology::Pairwise {
                    peer: stranger.clone()
                }
            )
            .await,
        Err(CodecError::NoKeyMaterial(_))
    );
    assert_matches!(
        alice
            .send(
                &conversation_id,
                b"hello?",
                &Topology::Group {
                    members: vec![stranger.clone()]
                }
            )
            .await,
        Err(CodecError::NoKeyMaterial(_))
    );
    assert!(alice.outbound_group_session(&conversation_id).is_none());

    // Explicit opt-in to send without encryption.
    let network = TestNetwork::new(Config::default().with_unencrypted_fallback(true));
    let mut alice = network.join("alice", "laptop", 1).await;
    assert_matches!(
        alice
            .send(&conversation_id, b"hello?", &Topology::Pairwise { peer: stranger })
            .await,
        Ok(SendOutcome::Unencrypted { plaintext }) if plaintext == b"hello?"
    );
}

#[tokio::test]
async fn signed_prekey_fallback() {
    let config = Config::default().with_onetime_prekeys(1, 1);
    let network = TestNetwork::new(config);
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut carol = network.join("carol", "laptop", 2).await;
    let mut bob = network.join("bob", "phone", 3).await;
    let bob_address = bob.address().clone();

    let conversation_id = ConversationId::new("fallback");
    let to_bob = Topology::Pairwise {
        peer: bob_address.clone(),
    };

    // Alice claims Bob's only one-time pre-key, Carol falls back to the signed pre-key.
    let (from_alice, _) = send(&mut alice, &conversation_id, b"from alice", &to_bob).await;
    let (from_carol, _) = send(&mut carol, &conversation_id, b"from carol", &to_bob).await;
    assert_eq!(
        network
            .directory()
            .onetime_prekey_count(&bob_address)
            .await
            .unwrap(),
        0
    );

    for (envelope, plaintext) in [
        (&from_alice, &b"from alice"[..]),
        (&from_carol, &b"from carol"[..]),
    ] {
        let received = bob.receive(&conversation_id, envelope).await.unwrap();
        assert_eq!(received.plaintext, plaintext);
    }

    // Without fallback the missing one-time pre-keys are an error.
    let network = TestNetwork::new(
        Config::default()
            .with_onetime_prekeys(1, 1)
            .with_signed_prekey_fallback(false),
    );
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut carol = network.join("carol", "laptop", 2).await;
    let _bob = network.join("bob", "phone", 3).await;
    send(&mut alice, &conversation_id, b"from alice", &to_bob).await;
    assert_matches!(
        carol.send(&conversation_id, b"from carol", &to_bob).await,
        Err(CodecError::NoKeyMaterial(_))
    );
}

#[tokio::test]
async fn forged_sender_key() {
    let network = TestNetwork::new(Config::default());
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut bob = network.join("bob", "phone", 2).await;
    let mallory = network.join("mallory", "laptop", 3).await;

    let conversation_id = ConversationId::new("alice-bob");
    let (envelope, _) = send(
        &mut alice,
        &conversation_id,
        b"hello",
        &Topology::Pairwise {
            peer: bob.address().clone(),
        },
    )
    .await;

    // Same message, but claiming a different identity key for Alice.
    let mut entries = envelope_entries(&envelope);
    for (key, entry) in entries.iter_mut() {
        if key.as_text() == Some("sender_key") {
            *entry = ciborium::Value::Bytes(mallory.identity_key().to_bytes().to_vec());
        }
    }
    let forged = envelope_from_entries(entries);
    assert_eq!(forged.sender_key(), &mallory.identity_key());

    assert_eq!(
        bob.receive(&conversation_id, &forged).await,
        Err(DecryptionFailure::Undecryptable)
    );
    let received = bob.receive(&conversation_id, &envelope).await.unwrap();
    assert_eq!(received.plaintext, b"hello");
}

#[tokio::test]
async fn message_index_only_on_group_envelopes() {
    let network = TestNetwork::new(Config::default());
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut bob = network.join("bob", "phone", 2).await;
    let bob_address = bob.address().clone();

    let conversation_id = ConversationId::new("alice-bob");
    let (pairwise, _) = send(
        &mut alice,
        &conversation_id,
        b"hello",
        &Topology::Pairwise {
            peer: bob_address.clone(),
        },
    )
    .await;
    let (group, _) = send(
        &mut alice,
        &conversation_id,
        b"hello group",
        &Topology::Group {
            members: vec![bob_address],
        },
    )
    .await;

    assert!(!has_entry(&envelope_entries(&pairwise), "message_index"));
    assert!(has_entry(&envelope_entries(&group), "message_index"));

    // A pairwise envelope carrying an index is malformed.
    let mut entries = envelope_entries(&pairwise);
    entries.push((
        ciborium::Value::Text("message_index".into()),
        ciborium::Value::Integer(0.into()),
    ));
    let malformed = envelope_from_entries(entries);
    assert_eq!(malformed.message_index(), Some(0));
    assert_eq!(
        bob.receive(&conversation_id, &malformed).await,
        Err(DecryptionFailure::Undecryptable)
    );

    let received = bob.receive(&conversation_id, &pairwise).await.unwrap();
    assert_eq!(received.plaintext, b"hello");
}

#[tokio::test]
async fn retired_device() {
    let network = TestNetwork::new(Config::default());
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut bob = network.join("bob", "phone", 2).await;
    let bob_address = bob.address().clone();

    let conversation_id = ConversationId::new("alice-bob");
    let to_bob = Topology::Pairwise {
        peer: bob_address.clone(),
    };
    let (envelope, _) = send(&mut alice, &conversation_id, b"hello", &to_bob).await;
    bob.receive(&conversation_id, &envelope).await.unwrap();
    let session_id = alice.pairwise_session(&bob_address).unwrap();

    // The established session is not used for retired devices anymore.
    alice.devices_mut().retire(&bob_address).unwrap();
    let result = alice.send(&conversation_id, b"still there?", &to_bob).await;
    assert_matches!(
        &result,
        Err(CodecError::Distribution(DistributionError::Retired(device))) if *device == bob_address
    );
    assert_matches!(&result, Err(err) if err.class() == ErrorClass::KeyAvailability);
    assert_eq!(alice.pairwise_session(&bob_address), Some(session_id));

    // Group sessions leave retired devices out.
    let alice_address = alice.address().clone();
    let outcome = alice
        .send(
            &conversation_id,
            b"hello group",
            &Topology::Group {
                members: vec![alice_address, bob_address],
            },
        )
        .await
        .unwrap();
    assert_matches!(
        outcome,
        SendOutcome::Encrypted { distribution, .. } if distribution.is_empty()
    );
}

#[tokio::test]
async fn partial_distribution() {
    let network = TestNetwork::new(Config::default());
    let mut xavier = network.join("xavier", "laptop", 1).await;
    let mut yasmin = network.join("yasmin", "phone", 2).await;
    let yasmin_address = yasmin.address().clone();
    let stranger = DeviceAddress::new("stranger", "unknown");

    let conversation_id = ConversationId::new("garden-club");
    let topology = Topology::Group {
        members: vec![
            xavier.address().clone(),
            stranger.clone(),
            yasmin_address.clone(),
        ],
    };

    // One member without pre-keys doesn't stop the others from receiving the session.
    let outcome = xavier
        .send(&conversation_id, b"Hello, Garden!", &topology)
        .await
        .unwrap();
    let SendOutcome::Encrypted {
        envelope,
        distribution,
    } = outcome
    else {
        panic!("message was not encrypted");
    };
    assert_eq!(distribution.len(), 2);

    let failed = distribution
        .iter()
        .find(|outcome| outcome.device == stranger)
        .unwrap();
    assert!(!failed.is_ok());
    assert_matches!(
        &failed.result,
        Err(DistributionError::Directory(PrekeyDirectoryError::DeviceUnknown(device)))
            if *device == stranger
    );
    assert_matches!(
        &failed.result,
        Err(err) if err.class() == ErrorClass::KeyAvailability
    );

    let delivered = distribution
        .iter()
        .find(|outcome| outcome.device == yasmin_address)
        .unwrap();
    assert!(delivered.is_ok());

    yasmin.claim_pending().await.unwrap();
    let received = yasmin.receive(&conversation_id, &envelope).await.unwrap();
    assert_eq!(received.plaintext, b"Hello, Garden!");

    // The stranger is still unreachable on a reshare.
    let outcomes = xavier
        .reshare(&conversation_id, &[stranger.clone()])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].is_ok());
}

#[tokio::test]
async fn claim_skips_invalid_shares() {
    let network = TestNetwork::new(Config::default());
    let mut xavier = network.join("xavier", "laptop", 1).await;
    let mut yasmin = network.join("yasmin", "phone", 2).await;
    let mut zoe = network.join("zoe", "tablet", 3).await;
    let yasmin_address = yasmin.address().clone();
    let zoe_address = zoe.address().clone();

    // Yasmin believes Zoe's device has another identity key than the one it uses.
    let xavier_key = xavier.identity_key();
    yasmin
        .devices_mut()
        .register(&zoe_address, &xavier_key)
        .unwrap();

    let conversation_id = ConversationId::new("garden-club");
    let topology = Topology::Group {
        members: vec![
            xavier.address().clone(),
            yasmin_address.clone(),
            zoe_address.clone(),
        ],
    };
    let (from_zoe, _) = send(&mut zoe, &conversation_id, b"from zoe", &topology).await;
    let (from_xavier, _) = send(&mut xavier, &conversation_id, b"from xavier", &topology).await;

    let report = yasmin.claim_pending().await.unwrap();
    assert_eq!(report.imported, vec![from_xavier.session_id()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].sender, zoe_address);
    assert_eq!(report.skipped[0].class, ErrorClass::ProtocolViolation);

    // The skipped share stays in the mailbox, the imported one is gone.
    let pending = network.mailbox().fetch_pending(&yasmin_address).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].share_id(), &report.skipped[0].share_id);
    assert_eq!(pending[0].sender(), &zoe_address);

    let received = yasmin.receive(&conversation_id, &from_xavier).await.unwrap();
    assert_eq!(received.plaintext, b"from xavier");
    assert_eq!(
        yasmin.receive(&conversation_id, &from_zoe).await,
        Err(DecryptionFailure::SessionUnavailable)
    );

    // Claiming again keeps skipping it.
    let report = yasmin.claim_pending().await.unwrap();
    assert!(report.imported.is_empty());
    assert_eq!(report.skipped.len(), 1);
}

#[tokio::test]
async fn only_public_state_is_exposed() {
    let network = TestNetwork::new(Config::default().with_onetime_prekeys(1, 1));
    let mut alice = network.join("alice", "laptop", 1).await;
    let mut bob = network.join("bob", "phone", 2).await;
    let bob_address = bob.address().clone();

    let conversation_id = ConversationId::new("garden-club");
    let (envelope, _) = send(
        &mut alice,
        &conversation_id,
        b"hello",
        &Topology::Group {
            members: vec![bob_address.clone()],
        },
    )
    .await;
    bob.claim_pending().await.unwrap();
    bob.receive(&conversation_id, &envelope).await.unwrap();

    assert_eq!(
        alice.outbound_group_session(&conversation_id),
        Some(envelope.session_id())
    );
    assert!(alice.pairwise_session(&bob_address).is_some());
    assert_eq!(
        bob.inbound_group_session(&envelope.session_id())
            .map(|info| info.first_known_index),
        Some(0)
    );

    for codec in [&alice, &bob] {
        let output = format!("{codec:?}");
        assert!(output.contains("identity_key"));
        assert!(!output.contains("identity_secret"));
        assert!(!output.contains("onetime_secrets"));
        assert!(!output.contains("chain_key"));
        assert!(!output.contains("root_key"));
        assert!(!output.contains("sessions"));
    }

    // Alice used up Bob's only one-time pre-key, publishing again refills it.
    assert_eq!(bob.publish_prekeys().await.unwrap(), 1);
    assert_eq!(bob.publish_prekeys().await.unwrap(), 0);
}
