//! Signed prescriptions after issue: adherence counters, supersession and
//! expiry. A prescription row is never deleted or re-signed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::SessionError;
use crate::db::{self, Store};
use crate::models::{PrescriptionRequest, PrescriptionStatus, TelePrescription};
use crate::signing::PrescriptionSigner;

#[derive(Clone)]
pub struct PrescriptionService {
    store: Arc<Store>,
    signer: Arc<dyn PrescriptionSigner>,
}

impl PrescriptionService {
    pub fn new(store: Arc<Store>, signer: Arc<dyn PrescriptionSigner>) -> Self {
        Self { store, signer }
    }

    /// Build and sign a prescription for `session_id` issued at `issued_at`.
    /// Nothing is stored.
    pub fn issue(
        &self,
        session_id: Uuid,
        request: &PrescriptionRequest,
        signer_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<TelePrescription, SessionError> {
        if request.name.trim().is_empty() {
            return Err(SessionError::Validation("prescription name is required".into()));
        }
        if request.duration_days == 0 {
            return Err(SessionError::Validation(format!(
                "prescription '{}' needs a duration of at least one day",
                request.name
            )));
        }

        let mut prescription = TelePrescription {
            id: Uuid::new_v4(),
            session_id,
            prescription_type: request.prescription_type,
            name: request.name.clone(),
            dosage: request.dosage.clone(),
            frequency: request.frequency.clone(),
            duration_days: request.duration_days,
            instructions: request.instructions.clone(),
            warnings: request.warnings.clone(),
            signature: String::new(),
            signed_by: signer_id.to_string(),
            issued_at,
            expires_at: issued_at + Duration::days(i64::from(request.duration_days)),
            doses_taken: 0,
            doses_missed: 0,
            last_adherence_at: None,
            status: PrescriptionStatus::Active,
        };
        prescription.signature = self.signer.sign(&prescription.signing_payload(), signer_id)?;
        Ok(prescription)
    }

    pub fn get(&self, id: &Uuid) -> Result<TelePrescription, SessionError> {
        self.store
            .with_conn(|conn| db::get_prescription(conn, id).map_err(SessionError::from))?
            .ok_or(SessionError::NotFound {
                entity: "prescription",
                id: *id,
            })
    }

    pub fn for_session(&self, session_id: &Uuid) -> Result<Vec<TelePrescription>, SessionError> {
        self.store
            .with_conn(|conn| db::get_prescriptions_by_session(conn, session_id))
            .map_err(SessionError::from)
    }

    /// Count one taken or missed dose.
    pub fn record_adherence(&self, id: &Uuid, taken: bool) -> Result<TelePrescription, SessionError> {
        let updated = self.store.with_tx(|tx| {
            let current = self.require_active(tx, id)?;
            db::record_prescription_adherence(tx, &current.id, taken, Utc::now())?;
            db::get_prescription(tx, id)?.ok_or(SessionError::NotFound {
                entity: "prescription",
                id: *id,
            })
        })?;
        tracing::debug!(
            prescription_id = %id,
            taken,
            doses_taken = updated.doses_taken,
            doses_missed = updated.doses_missed,
            "Adherence recorded"
        );
        Ok(updated)
    }

    /// Replace an active prescription's status with cancelled or expired.
    pub fn supersede(&self, id: &Uuid, status: PrescriptionStatus) -> Result<TelePrescription, SessionError> {
        if status == PrescriptionStatus::Active {
            return Err(SessionError::Validation(
                "a prescription can only be superseded by cancelled or expired".into(),
            ));
        }
        let updated = self.store.with_tx(|tx| {
            self.require_active(tx, id)?;
            db::supersede_prescription(tx, id, status)?;
            db::get_prescription(tx, id)?.ok_or(SessionError::NotFound {
                entity: "prescription",
                id: *id,
            })
        })?;
        tracing::info!(prescription_id = %id, status = %status, "Prescription superseded");
        Ok(updated)
    }

    /// Mark active prescriptions past their expiry as expired. Returns their ids.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, SessionError> {
        let expired = self.store.with_tx(|tx| {
            let due = db::get_expired_active_prescriptions(tx, now)?;
            let mut ids = Vec::with_capacity(due.len());
            for p in due {
                db::supersede_prescription(tx, &p.id, PrescriptionStatus::Expired)?;
                ids.push(p.id);
            }
            Ok::<_, SessionError>(ids)
        })?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Prescriptions expired");
        }
        Ok(expired)
    }

    /// Check the stored signature against the prescription's current content.
    pub fn verify(&self, prescription: &TelePrescription) -> bool {
        self.signer.verify(
            &prescription.signing_payload(),
            &prescription.signed_by,
            &prescription.signature,
        )
    }

    fn require_active(
        &self,
        conn: &rusqlite::Connection,
        id: &Uuid,
    ) -> Result<TelePrescription, SessionError> {
        let current = db::get_prescription(conn, id)?.ok_or(SessionError::NotFound {
            entity: "prescription",
            id: *id,
        })?;
        if current.status != PrescriptionStatus::Active {
            return Err(SessionError::InvalidState(format!(
                "prescription is {}",
                current.status
            )));
        }
        Ok(current)
    }
}

impl std::fmt::Debug for PrescriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrescriptionService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::session_fixture;
    use crate::models::PrescriptionType;
    use crate::signing::DigestSigner;

    fn request(name: &str, days: u32) -> PrescriptionRequest {
        PrescriptionRequest {
            prescription_type: PrescriptionType::Medication,
            name: name.into(),
            dosage: "400 mg".into(),
            frequency: "twice daily".into(),
            duration_days: days,
            instructions: "with food".into(),
            warnings: vec!["avoid alcohol".into()],
        }
    }

    fn setup() -> (PrescriptionService, Uuid) {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let session = session_fixture("pat-1");
        store
            .with_conn(|conn| db::insert_session(conn, &session))
            .unwrap();
        let service = PrescriptionService::new(store, Arc::new(DigestSigner::new(b"secret".to_vec())));
        (service, session.id)
    }

    fn stored(service: &PrescriptionService, session_id: Uuid, days: u32, issued_at: DateTime<Utc>) -> TelePrescription {
        let p = service
            .issue(session_id, &request("Ibuprofen", days), "dr-lee", issued_at)
            .unwrap();
        service
            .store
            .with_conn(|conn| db::insert_prescription(conn, &p))
            .unwrap();
        p
    }

    #[test]
    fn issued_prescription_verifies_until_tampered() {
        let (service, session_id) = setup();
        let p = service
            .issue(session_id, &request("Ibuprofen", 7), "dr-lee", Utc::now())
            .unwrap();
        assert!(!p.signature.is_empty());
        assert_eq!(p.expires_at - p.issued_at, Duration::days(7));
        assert!(service.verify(&p));

        let mut tampered = p.clone();
        tampered.dosage = "800 mg".into();
        assert!(!service.verify(&tampered));
    }

    #[test]
    fn issue_rejects_zero_duration_and_blank_name() {
        let (service, session_id) = setup();
        assert!(matches!(
            service.issue(session_id, &request("Ibuprofen", 0), "dr-lee", Utc::now()),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            service.issue(session_id, &request("  ", 5), "dr-lee", Utc::now()),
            Err(SessionError::Validation(_))
        ));
    }

    #[test]
    fn adherence_counts_accumulate() {
        let (service, session_id) = setup();
        let p = stored(&service, session_id, 7, Utc::now());

        service.record_adherence(&p.id, true).unwrap();
        service.record_adherence(&p.id, true).unwrap();
        let after = service.record_adherence(&p.id, false).unwrap();
        assert_eq!(after.doses_taken, 2);
        assert_eq!(after.doses_missed, 1);
        assert!(after.last_adherence_at.is_some());
        // Counters are outside the signed payload.
        assert!(service.verify(&after));
    }

    #[test]
    fn superseded_prescription_is_final() {
        let (service, session_id) = setup();
        let p = stored(&service, session_id, 7, Utc::now());

        assert!(matches!(
            service.supersede(&p.id, PrescriptionStatus::Active),
            Err(SessionError::Validation(_))
        ));
        let cancelled = service.supersede(&p.id, PrescriptionStatus::Cancelled).unwrap();
        assert_eq!(cancelled.status, PrescriptionStatus::Cancelled);
        assert!(matches!(
            service.record_adherence(&p.id, true),
            Err(SessionError::InvalidState(_))
        ));
        assert!(matches!(
            service.supersede(&p.id, PrescriptionStatus::Expired),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn expire_due_only_touches_past_expiry() {
        let (service, session_id) = setup();
        let old = stored(&service, session_id, 3, Utc::now() - Duration::days(10));
        let current = stored(&service, session_id, 30, Utc::now());

        let expired = service.expire_due(Utc::now()).unwrap();
        assert_eq!(expired, vec![old.id]);
        assert_eq!(service.get(&old.id).unwrap().status, PrescriptionStatus::Expired);
        assert_eq!(service.get(&current.id).unwrap().status, PrescriptionStatus::Active);
        assert!(service.expire_due(Utc::now()).unwrap().is_empty());
        assert_eq!(service.for_session(&session_id).unwrap().len(), 2);
    }

    #[test]
    fn unknown_prescription_not_found() {
        let (service, _) = setup();
        assert!(matches!(
            service.record_adherence(&Uuid::new_v4(), true),
            Err(SessionError::NotFound { entity: "prescription", .. })
        ));
    }
}
