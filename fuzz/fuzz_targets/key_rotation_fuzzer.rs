//! Fuzz target for the send key state machine
//!
//! Arbitrary sequences of sends, confirmations and membership changes drive
//! a real handler alongside the reference rotation model.
//!
//! # Invariants
//!
//! - Every send is classified the way the model predicts
//! - An unconfirmed key exists exactly when the model says so
//! - Membership changes while a key is unconfirmed keep it in use until it
//!   is confirmed, and peers who joined in between get a follow-up key
//!   command under the permanent id
//! - Confirmation never fails when a key is outstanding

#![no_main]

use std::rc::Rc;

use futures::executor::block_on;
use libfuzzer_sys::fuzz_target;
use strongvelope_harness::{
    MemoryDirectory, MemoryKeyCache, Operation, Outcome, RotationModel, SeededEnv, SimRelay,
    TestUser,
};
use strongvelope_proto::{ChatId, KeyId, KeyIdCommand, Message, MessageId, MessageType};

const CHAT: ChatId = ChatId(0xF022);
const MAX_OPERATIONS: usize = 64;

fn peer(index: u8) -> TestUser {
    let index = index % 4;
    TestUser::new(10 + u64::from(index), 10 + index)
}

fuzz_target!(|ops: Vec<Operation>| {
    let alice = TestUser::new(1, 1);
    let directory = MemoryDirectory::new();
    alice.register(&directory);
    for index in 0..4 {
        peer(index).register(&directory);
    }
    let Ok(handler) =
        alice.handler(CHAT, &directory, &Rc::new(MemoryKeyCache::new()), &SeededEnv::default())
    else {
        return;
    };

    let mut relay = SimRelay::new(CHAT);
    let mut model = RotationModel::new();
    let mut outstanding: Option<KeyIdCommand> = None;

    for (tx, op) in ops.into_iter().take(MAX_OPERATIONS).enumerate() {
        let op = match op {
            Operation::Join { peer } => Operation::Join { peer: peer % 4 },
            Operation::Leave { peer } => Operation::Leave { peer: peer % 4 },
            other => other,
        };
        let expected = model.apply(op);

        let actual = match op {
            Operation::Send { len } => {
                let mut msg = Message::new_outgoing(
                    MessageId(tx as u64 + 1),
                    alice.id,
                    0,
                    MessageType::Normal,
                    vec![b'x'; usize::from(len)],
                );
                let output = block_on(handler.encrypt(&mut msg)).expect("send succeeds");
                let receipt = relay.submit(alice.id, &output).expect("relay accepts");
                if output.key_command.is_some() {
                    outstanding = receipt.key_id;
                    Outcome::NewKey
                } else if output.command.key_id == KeyId::UNCONFIRMED {
                    Outcome::ReusedUnconfirmed
                } else {
                    Outcome::ReusedConfirmed
                }
            },
            Operation::Confirm => match outstanding.take() {
                Some(confirmation) => {
                    let follow_up = block_on(handler.on_key_confirmed(
                        confirmation.local_id,
                        confirmation.key_id,
                        &mut [],
                    ))
                    .expect("outstanding key confirms");
                    match follow_up {
                        Some(delivery) => {
                            relay.submit_key(alice.id, &delivery).expect("relay accepts");
                            Outcome::ConfirmedWithFollowUp
                        },
                        None => Outcome::Confirmed,
                    }
                },
                None => Outcome::NothingToConfirm,
            },
            Operation::Join { peer: index } => {
                handler.add_participant(peer(index).id);
                Outcome::Membership
            },
            Operation::Leave { peer: index } => {
                handler.remove_participant(peer(index).id);
                Outcome::Membership
            },
        };

        assert_eq!(actual, expected, "operation {op:?}");
        assert_eq!(handler.has_unconfirmed_key(), model.has_unconfirmed());
    }
});
