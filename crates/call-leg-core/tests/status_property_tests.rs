//! Property tests for status code and session interval validation

mod common;

use proptest::prelude::*;

use common::Harness;
use rvoip_call_leg_core::prelude::*;
use rvoip_call_leg_core::session_timer::{RefresherPreference, SessionTimerParams};

const CALL_ID: &str = "prop@biloxi.example.com";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Anything outside 300-699 is refused before the call-leg is touched.
    #[test]
    fn reject_outside_range_changes_nothing(status in prop_oneof![0u16..300, 700u16..=u16::MAX]) {
        let h = Harness::new(CallLegMgrConfig::default());
        let (leg, tx, _) = h.incoming_call(CALL_ID);

        let err = h.manager.reject(leg, status).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::BadParam);
        prop_assert_eq!(h.state(leg), CallLegState::Offering);
        prop_assert!(h.transactions.statuses(tx).is_empty());
    }

    /// Every final failure status ends an offered call-leg.
    #[test]
    fn reject_in_range_answers_with_that_status(status in 300u16..700) {
        let h = Harness::new(CallLegMgrConfig::default());
        let (leg, tx, _) = h.incoming_call(CALL_ID);

        h.manager.reject(leg, status).unwrap();
        prop_assert_eq!(h.transactions.statuses(tx), vec![status]);
        prop_assert_eq!(h.manager.call_leg_count(), 0);
    }

    #[test]
    fn provisional_statuses(status in 0u16..1000) {
        let h = Harness::new(CallLegMgrConfig::default());
        let (leg, tx, _) = h.incoming_call(CALL_ID);

        let result = h.manager.provisional_response(leg, status);
        if (100..200).contains(&status) {
            prop_assert!(result.is_ok());
            prop_assert_eq!(h.transactions.statuses(tx), vec![status]);
        } else {
            prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::BadParam);
            prop_assert!(h.transactions.statuses(tx).is_empty());
        }
        prop_assert_eq!(h.state(leg), CallLegState::Offering);
    }

    #[test]
    fn session_interval_must_cover_min_se(session_expires in 0u32..10_000, min_se in 90u32..10_000) {
        let params = SessionTimerParams::new(session_expires, min_se, RefresherPreference::DontCare);
        let valid = session_expires == 0 || min_se <= session_expires;
        prop_assert_eq!(params.validate().is_ok(), valid);
    }
}
