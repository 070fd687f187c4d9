mod pool;
mod rows;
mod store;

pub use pool::{create_pool, DatabasePool, DatabasePoolInterface};
pub use store::MySqlStore;

#[cfg(test)]
mod tests {
    use super::rows::occurrence_status_from_code;
    use milvaion_core::OccurrenceStatus;

    #[test]
    fn status_code_roundtrips_for_every_variant() {
        let variants = [
            OccurrenceStatus::Queued,
            OccurrenceStatus::Running,
            OccurrenceStatus::Completed,
            OccurrenceStatus::Failed,
            OccurrenceStatus::Cancelled,
            OccurrenceStatus::TimedOut,
            OccurrenceStatus::Unknown,
        ];
        for status in variants {
            let code = status as i8;
            assert_eq!(occurrence_status_from_code(code).unwrap() as i8, code);
        }
    }

    #[test]
    fn unknown_status_code_is_rejected() {
        assert!(occurrence_status_from_code(99).is_err());
    }
}
