//! Lifecycle tests for queue-backed messengers
//!
//! Each test drives an [`AsyncMessenger`] over a [`RecordingTransport`] and
//! checks the notifications observed by a state listener.


use endpoint_core::{
    listener, EndpointError, Message, Messenger, MessengerState, SendOutcome, StateBarrier,
    StateChangeNotifier, StateMask,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_utils::{connected_messenger, record_states, unresolved_messenger};

// ----------------------------------------------------------------------------
// Backpressure
// ----------------------------------------------------------------------------

#[test]
fn test_saturation_then_drain_scenario() {
    let messenger = connected_messenger(10);
    let seen = record_states(&*messenger);

    let messages: Vec<Message> = (0..10).map(|_| Message::new()).collect();
    for message in &messages {
        assert!(messenger.send_message_n(message, Some("svc"), None));
    }
    assert_eq!(messenger.state(), MessengerState::SendingSaturated);

    let overflow = Message::new();
    assert!(!messenger.send_message_n(&overflow, Some("svc"), None));
    assert_eq!(overflow.outcome(), Some(SendOutcome::Overflow));
    assert_eq!(messenger.state(), MessengerState::SendingSaturated);
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::Sending, MessengerState::SendingSaturated]
    );

    assert_eq!(messenger.pull_messages(), 10);
    assert_eq!(messenger.state(), MessengerState::Connected);
    for message in &messages {
        assert_eq!(message.outcome(), Some(SendOutcome::Submitted));
    }
    assert_eq!(messenger.transport().in_flight(), 10);
}

#[test]
fn test_capacity_one_saturates_immediately() {
    let messenger = connected_messenger(1);
    let seen = record_states(&*messenger);

    assert!(messenger.send_message_n(&Message::new(), None, None));
    assert_eq!(*seen.lock(), vec![MessengerState::SendingSaturated]);
}

#[test]
fn test_blocking_send_waits_for_capacity() {
    let messenger = connected_messenger(2);
    for _ in 0..2 {
        assert!(messenger.send_message_n(&Message::new(), None, None));
    }

    let blocked = Message::new();
    let sender = {
        let messenger = messenger.clone();
        let blocked = blocked.clone();
        thread::spawn(move || messenger.send_message_b(&blocked, None, None))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!sender.is_finished());

    while !sender.is_finished() {
        messenger.pull_messages();
        messenger.transport().complete_all();
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(sender.join().unwrap(), Ok(()));
    assert_eq!(blocked.outcome(), Some(SendOutcome::Succeeded));
    assert_eq!(messenger.stats().overflowed, 0);
}

#[test]
fn test_blocking_send_surfaces_transport_failure() {
    let messenger = connected_messenger(4);
    let sender = {
        let messenger = messenger.clone();
        thread::spawn(move || messenger.send_message_b(&Message::new(), None, None))
    };
    while !sender.is_finished() {
        messenger.pull_messages();
        messenger.transport().fail_all(EndpointError::runtime("wire cut"));
        thread::sleep(Duration::from_millis(2));
    }

    let err = sender.join().unwrap().unwrap_err();
    assert!(err.is_io());
    assert_eq!(err.cause(), Some(&EndpointError::runtime("wire cut")));
}

#[test]
fn test_blocking_send_on_closed_messenger() {
    let messenger = connected_messenger(4);
    messenger.close();

    let err = messenger
        .send_message_b(&Message::new(), None, None)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Messenger is closed. It cannot be used to send messages"
    );
}

// ----------------------------------------------------------------------------
// Close
// ----------------------------------------------------------------------------

#[test]
fn test_close_idle_messenger() {
    let messenger = connected_messenger(4);
    let seen = record_states(&*messenger);

    messenger.close();
    assert_eq!(*seen.lock(), vec![MessengerState::Closed]);
    assert_eq!(messenger.transport().close_requests(), 1);
    assert!(messenger.is_closed());
}

#[test]
fn test_close_with_pending_messages_defers_until_drained() {
    let messenger = connected_messenger(8);
    for _ in 0..3 {
        messenger.send_message_n(&Message::new(), None, None);
    }
    let seen = record_states(&*messenger);

    messenger.close();
    assert_eq!(*seen.lock(), vec![MessengerState::Closing]);
    assert_eq!(messenger.transport().close_requests(), 0);
    assert!(!messenger.send_message_n(&Message::new(), None, None));

    assert_eq!(messenger.pull_messages(), 3);
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::Closing, MessengerState::Closed]
    );
    assert_eq!(messenger.transport().close_requests(), 1);

    messenger.pull_messages();
    messenger.close();
    assert_eq!(messenger.transport().close_requests(), 1);
}

#[test]
fn test_flush_returns_after_close_drains() {
    let messenger = connected_messenger(8);
    messenger.send_message_n(&Message::new(), None, None);
    messenger.close();

    let flusher = {
        let messenger = messenger.clone();
        thread::spawn(move || messenger.flush())
    };
    thread::sleep(Duration::from_millis(10));
    messenger.pull_messages();
    assert_eq!(flusher.join().unwrap(), Ok(()));
}

// ----------------------------------------------------------------------------
// Connection Failure
// ----------------------------------------------------------------------------

#[test]
fn test_connection_failed_on_idle_messenger() {
    let messenger = connected_messenger(4);
    let seen = record_states(&*messenger);

    messenger.connection_failed();
    messenger.connection_failed();
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::Reconnecting, MessengerState::Broken]
    );
}

#[test]
fn test_connection_failed_fails_pending_before_publishing() {
    let messenger = connected_messenger(4);
    let pending: Vec<Message> = (0..3).map(|_| Message::new()).collect();
    for message in &pending {
        messenger.send_message_n(message, None, None);
    }

    let observed_failures = Arc::new(AtomicUsize::new(0));
    {
        let pending = pending.clone();
        let observed = observed_failures.clone();
        messenger.add_state_listener(listener(move |state: &MessengerState| {
            if *state == MessengerState::Reconnecting {
                let failed = pending
                    .iter()
                    .filter(|m| matches!(m.outcome(), Some(SendOutcome::Failed(_))))
                    .count();
                observed.store(failed, Ordering::SeqCst);
            }
            true
        }));
    }
    let seen = record_states(&*messenger);

    messenger.connection_failed();
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::Reconnecting, MessengerState::Broken]
    );
    assert_eq!(observed_failures.load(Ordering::SeqCst), 3);
    for message in &pending {
        let outcome = message.outcome().unwrap();
        assert_eq!(
            outcome.failure().map(ToString::to_string),
            Some("Messenger unexpectedly closed".to_string())
        );
    }
}

#[test]
fn test_connection_failed_while_closing() {
    let messenger = connected_messenger(4);
    messenger.send_message_n(&Message::new(), None, None);
    messenger.close();
    let seen = record_states(&*messenger);

    messenger.connection_failed();
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::ReconClosing, MessengerState::Broken]
    );
    assert_eq!(messenger.transport().close_requests(), 0);
}

#[test]
fn test_terminal_state_rejects_everything() {
    let messenger = connected_messenger(4);
    messenger.connection_failed();
    let seen = record_states(&*messenger);

    for _ in 0..3 {
        let message = Message::new();
        assert!(!messenger.send_message_n(&message, None, None));
        assert_eq!(
            message.outcome(),
            Some(SendOutcome::Failed(EndpointError::Closed))
        );
    }
    messenger.close();
    messenger.connection_close_complete();
    assert_eq!(messenger.pull_messages(), 0);

    assert_eq!(messenger.state(), MessengerState::Broken);
    assert!(seen.lock().is_empty());
}

// ----------------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------------

#[test]
fn test_unresolved_messenger_resolves_once() {
    let messenger = unresolved_messenger(4);
    messenger.resolve();
    messenger.resolve();
    messenger.send_message_n(&Message::new(), None, None);
    assert_eq!(messenger.transport().resolve_requests(), 1);

    let seen = record_states(&*messenger);
    messenger.connection_established();
    assert_eq!(
        *seen.lock(),
        vec![MessengerState::Resolved, MessengerState::Sending]
    );
}

#[test]
fn test_close_while_unresolved_waits_for_connection() {
    let messenger = unresolved_messenger(4);
    messenger.send_message_n(&Message::new(), None, None);
    messenger.close();
    assert_eq!(messenger.state(), MessengerState::Closing);

    assert_eq!(messenger.pull_messages(), 0);
    messenger.connection_established();
    assert_eq!(messenger.pull_messages(), 1);
    assert_eq!(messenger.state(), MessengerState::Closed);
    assert_eq!(messenger.transport().close_requests(), 1);
}

// ----------------------------------------------------------------------------
// Waiting
// ----------------------------------------------------------------------------

#[test]
fn test_wait_state_released_by_close() {
    let messenger = connected_messenger(4);
    let waiter = {
        let messenger = messenger.clone();
        thread::spawn(move || messenger.wait_state(StateMask::TERMINAL, Duration::ZERO))
    };
    thread::sleep(Duration::from_millis(10));
    messenger.close();

    assert_eq!(waiter.join().unwrap(), Ok(MessengerState::Closed));
}

#[test]
fn test_interrupt_waiters_releases_blocked_flush() {
    let messenger = connected_messenger(4);
    messenger.send_message_n(&Message::new(), None, None);

    let flusher = {
        let messenger = messenger.clone();
        thread::spawn(move || messenger.flush())
    };
    while !flusher.is_finished() {
        messenger.interrupt_waiters();
        thread::sleep(Duration::from_millis(5));
    }

    let err = flusher.join().unwrap().unwrap_err();
    assert!(err.is_io());
    assert!(err.is_interrupted());
}

#[test]
fn test_barrier_contract() {
    let barrier = StateBarrier::new(StateMask::CLOSED);
    barrier.messenger_state_changed(MessengerState::Closed);
    assert_eq!(
        barrier.await_match(Duration::ZERO),
        Ok(Some(MessengerState::Closed))
    );

    let barrier = StateBarrier::new(StateMask::CLOSED);
    assert_eq!(barrier.await_match(Duration::from_millis(15)), Ok(None));
    barrier.expire();
    assert!(!barrier.messenger_state_changed(MessengerState::Closed));
    assert!(!barrier.messenger_state_changed(MessengerState::Sending));
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

#[test]
fn test_notifier_round_trip_with_unregistering_listener() {
    let notifier = StateChangeNotifier::new();
    let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    for (i, count) in counts.iter().enumerate() {
        let count = count.clone();
        notifier.add_listener(listener(move |_: &MessengerState| {
            count.fetch_add(1, Ordering::SeqCst);
            i != 1
        }));
    }

    notifier.notify_new_state(&MessengerState::Sending);
    notifier.notify_new_state(&MessengerState::Connected);

    let totals: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(totals, vec![2, 1, 2]);
    assert_eq!(notifier.len(), 2);
}
