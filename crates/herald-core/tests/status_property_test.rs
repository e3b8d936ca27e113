//! Property-based tests for the notification and reminder status machines.
//!
//! Whatever order concurrent workers apply their updates in, a record must
//! never observe a backward status change and must never leave a terminal
//! status.

use chrono::Utc;
use herald_core::models::{
    Channel, DeliveryJob, MessageContent, NotificationStatus, NotificationUpdate, Recipient,
    ReminderStatus,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 200,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn notification_status_strategy() -> impl Strategy<Value = NotificationStatus> {
    prop::sample::select(NotificationStatus::ALL.to_vec())
}

fn reminder_status_strategy() -> impl Strategy<Value = ReminderStatus> {
    prop::sample::select(vec![
        ReminderStatus::Scheduled,
        ReminderStatus::Processing,
        ReminderStatus::Sent,
        ReminderStatus::Failed,
        ReminderStatus::Cancelled,
        ReminderStatus::Expired,
    ])
}

fn position(status: NotificationStatus) -> usize {
    match status {
        NotificationStatus::Scheduled => 0,
        NotificationStatus::Pending => 1,
        NotificationStatus::Sending => 2,
        NotificationStatus::Sent | NotificationStatus::Failed => 3,
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn interleaved_updates_never_move_backward(
        updates in prop::collection::vec(notification_status_strategy(), 1..40)
    ) {
        let now = Utc::now();
        let job = DeliveryJob::new(
            Channel::Email,
            Recipient::new("user", "user@example.com"),
            MessageContent::text("body"),
        );
        let mut record = job.to_record(now);

        for target in updates {
            let before = record.status;
            let applied = record.apply(&NotificationUpdate::status(target), now);

            prop_assert_eq!(applied, before.can_transition_to(target));
            prop_assert!(position(record.status) >= position(before));
            if before.is_terminal() {
                prop_assert_eq!(record.status, before);
            }
        }
    }

    #[test]
    fn allowed_sources_match_transition_table(target in notification_status_strategy()) {
        for source in NotificationStatus::ALL {
            prop_assert_eq!(
                target.allowed_sources().contains(&source),
                source.can_transition_to(target)
            );
        }
    }

    #[test]
    fn terminal_reminders_have_no_exits(
        from in reminder_status_strategy(),
        to in reminder_status_strategy()
    ) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        prop_assert!(!from.can_transition_to(from));
    }
}
