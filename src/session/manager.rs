//! Teleconsult session state machine.
//!
//! ```text
//! scheduled ──► waiting ──► in_progress ──► completed
//!     │            │             │
//!     ├────────────┴─────────────┴──► cancelled
//!     └────────────┴──► no_show
//! ```
//!
//! Every transition re-reads the row inside one transaction and writes it with
//! a compare-on-status update, so a transition either fully applies or leaves
//! the session untouched.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::prescriptions::PrescriptionService;
use super::provider::{MediaProvider, ProviderRegistry};
use super::qos::QosSampler;
use super::SessionError;
use crate::db::{self, Store};
use crate::models::{
    ClinicalSummary, NewSession, SessionStatus, TelePrescription, TeleconsultSession, VitalAnalysis,
    VitalSigns,
};
use crate::vitals;

/// Result of a successful `start`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session: TeleconsultSession,
    pub provider: String,
    pub room_id: String,
    pub patient_token: String,
    pub clinician_token: String,
}

/// Result of a successful `end`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionClose {
    pub session: TeleconsultSession,
    pub prescriptions: Vec<TelePrescription>,
}

struct Room {
    provider: Arc<dyn MediaProvider>,
    room_id: String,
    patient_token: String,
    clinician_token: String,
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Arc<Store>,
    providers: Arc<ProviderRegistry>,
    prescriptions: PrescriptionService,
    sampler: QosSampler,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        providers: Arc<ProviderRegistry>,
        prescriptions: PrescriptionService,
        sampler: QosSampler,
    ) -> Self {
        Self {
            store,
            providers,
            prescriptions,
            sampler,
        }
    }

    pub fn sampler(&self) -> &QosSampler {
        &self.sampler
    }

    // ═══════════════════════════════════════════════════════════
    // Scheduling
    // ═══════════════════════════════════════════════════════════

    pub fn create(&self, request: NewSession) -> Result<TeleconsultSession, SessionError> {
        if request.patient_id.trim().is_empty() || request.clinician_id.trim().is_empty() {
            return Err(SessionError::Validation("patient and clinician ids are required".into()));
        }
        let now = Utc::now();
        if request.scheduled_start <= now {
            return Err(SessionError::Validation("scheduled start must be in the future".into()));
        }
        if request.scheduled_end <= request.scheduled_start {
            return Err(SessionError::Validation(
                "scheduled end must be after scheduled start".into(),
            ));
        }

        let session = TeleconsultSession {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            clinician_id: request.clinician_id,
            session_type: request.session_type,
            status: SessionStatus::Scheduled,
            scheduled_start: request.scheduled_start,
            scheduled_end: request.scheduled_end,
            actual_start: None,
            actual_end: None,
            duration_secs: None,
            consent_signed: false,
            consent_at: None,
            provider_name: None,
            room_id: None,
            connection_quality: None,
            vital_signs: None,
            vital_analysis: None,
            assessment: None,
            diagnoses: Vec::new(),
            treatment_plan: None,
            follow_up_required: false,
            follow_up_date: None,
            cancellation_reason: None,
            billable: request.billable,
            billed: false,
            created_at: now,
            updated_at: now,
        };
        self.store
            .with_conn(|conn| db::insert_session(conn, &session))
            .map_err(SessionError::from)?;

        tracing::info!(
            session_id = %session.id,
            patient_id = %session.patient_id,
            session_type = %session.session_type,
            "Session scheduled"
        );
        Ok(session)
    }

    pub fn get(&self, id: &Uuid) -> Result<TeleconsultSession, SessionError> {
        self.store
            .with_conn(|conn| db::get_session(conn, id).map_err(SessionError::from))?
            .ok_or_else(|| SessionError::session_not_found(id))
    }

    pub fn list_for_patient(&self, patient_id: &str) -> Result<Vec<TeleconsultSession>, SessionError> {
        self.store
            .with_conn(|conn| db::list_sessions_by_patient(conn, patient_id))
            .map_err(SessionError::from)
    }

    pub fn list_by_status(&self, status: SessionStatus) -> Result<Vec<TeleconsultSession>, SessionError> {
        self.store
            .with_conn(|conn| db::list_sessions_by_status(conn, status))
            .map_err(SessionError::from)
    }

    pub fn join_waiting_room(&self, id: &Uuid) -> Result<TeleconsultSession, SessionError> {
        let session = self.transition(id, "join the waiting room of", &[SessionStatus::Scheduled], |s| {
            s.status = SessionStatus::Waiting;
            Ok(())
        })?;
        tracing::info!(session_id = %id, "Patient joined waiting room");
        Ok(session)
    }

    pub fn record_consent(&self, id: &Uuid) -> Result<TeleconsultSession, SessionError> {
        let session = self.transition(
            id,
            "record consent for",
            &[SessionStatus::Scheduled, SessionStatus::Waiting, SessionStatus::InProgress],
            |s| {
                if !s.consent_signed {
                    s.consent_signed = true;
                    s.consent_at = Some(Utc::now());
                }
                Ok(())
            },
        )?;
        tracing::info!(session_id = %id, "Consent recorded");
        Ok(session)
    }

    // ═══════════════════════════════════════════════════════════
    // Live session
    // ═══════════════════════════════════════════════════════════

    /// Open a media room and move the session to in_progress.
    pub fn start(&self, id: &Uuid) -> Result<SessionStart, SessionError> {
        let current = self.get(id)?;
        check_startable(&current)?;

        let room = self.open_room(&current)?;

        let started = self.transition(id, "start", &[SessionStatus::Scheduled, SessionStatus::Waiting], |s| {
            check_startable(s)?;
            s.status = SessionStatus::InProgress;
            s.actual_start = Some(Utc::now());
            s.provider_name = Some(room.provider.name().to_string());
            s.room_id = Some(room.room_id.clone());
            Ok(())
        });
        let session = match started {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = room.provider.close_room(&room.room_id) {
                    tracing::warn!(room_id = %room.room_id, error = %close_err, "Failed to close orphaned room");
                }
                return Err(e);
            }
        };

        self.sampler.activate(session.id);
        tracing::info!(
            session_id = %id,
            provider = %room.provider.name(),
            room_id = %room.room_id,
            "Session started"
        );
        Ok(SessionStart {
            session,
            provider: room.provider.name().to_string(),
            room_id: room.room_id,
            patient_token: room.patient_token,
            clinician_token: room.clinician_token,
        })
    }

    /// Try active providers in priority order until one yields a room and
    /// both access tokens.
    fn open_room(&self, session: &TeleconsultSession) -> Result<Room, SessionError> {
        for provider in self.providers.candidates()? {
            let room_id = match provider.create_room(session) {
                Ok(room_id) => room_id,
                Err(e) => {
                    tracing::warn!(provider = %provider.name(), error = %e, "Room creation failed, trying next provider");
                    continue;
                }
            };
            let tokens = provider
                .issue_access_token(&session.patient_id, &room_id)
                .and_then(|p| {
                    provider
                        .issue_access_token(&session.clinician_id, &room_id)
                        .map(|c| (p, c))
                });
            match tokens {
                Ok((patient_token, clinician_token)) => {
                    return Ok(Room {
                        provider,
                        room_id,
                        patient_token,
                        clinician_token,
                    })
                }
                Err(e) => {
                    tracing::warn!(provider = %provider.name(), error = %e, "Token issue failed, trying next provider");
                    if let Err(close_err) = provider.close_room(&room_id) {
                        tracing::warn!(room_id = %room_id, error = %close_err, "Failed to close room");
                    }
                }
            }
        }
        Err(SessionError::NoProviderAvailable)
    }

    /// Complete an in-progress session with the clinician's summary. Each
    /// requested prescription is signed and stored with the session.
    pub fn end(&self, id: &Uuid, summary: Option<ClinicalSummary>) -> Result<SessionClose, SessionError> {
        let current = self.get(id)?;
        if current.status != SessionStatus::InProgress {
            return Err(SessionError::InvalidState(format!(
                "cannot end a {} session",
                current.status
            )));
        }
        let summary = summary.ok_or_else(|| {
            SessionError::Validation("a clinical summary is required to end the session".into())
        })?;
        if summary.assessment.trim().is_empty() {
            return Err(SessionError::Validation("assessment must not be empty".into()));
        }

        let ended_at = Utc::now();
        let prescriptions = summary
            .prescriptions
            .iter()
            .map(|request| self.prescriptions.issue(*id, request, &current.clinician_id, ended_at))
            .collect::<Result<Vec<_>, _>>()?;

        let session = self.store.with_tx(|tx| {
            let mut s = db::get_session(tx, id)?.ok_or_else(|| SessionError::session_not_found(id))?;
            if s.status != SessionStatus::InProgress {
                return Err(SessionError::InvalidState(format!("cannot end a {} session", s.status)));
            }
            let started_at = s.actual_start.unwrap_or(ended_at);
            s.status = SessionStatus::Completed;
            s.actual_end = Some(ended_at);
            s.duration_secs = Some((ended_at - started_at).num_seconds().max(0));
            s.assessment = Some(summary.assessment.clone());
            s.diagnoses = summary.diagnoses.clone();
            s.treatment_plan = Some(summary.treatment_plan.clone()).filter(|t| !t.trim().is_empty());
            s.follow_up_required = summary.follow_up_required;
            s.follow_up_date = summary.follow_up_date;
            s.updated_at = ended_at;
            if !db::update_session(tx, &s, SessionStatus::InProgress)? {
                return Err(SessionError::InvalidState("session changed concurrently".into()));
            }
            for p in &prescriptions {
                db::insert_prescription(tx, p)?;
            }
            Ok(s)
        })?;

        self.release(&session);
        tracing::info!(
            session_id = %id,
            duration_secs = session.duration_secs.unwrap_or(0),
            prescriptions = prescriptions.len(),
            "Session completed"
        );
        Ok(SessionClose {
            session,
            prescriptions,
        })
    }

    pub fn cancel(&self, id: &Uuid, reason: &str) -> Result<TeleconsultSession, SessionError> {
        if reason.trim().is_empty() {
            return Err(SessionError::Validation("cancellation reason is required".into()));
        }
        let session = self.transition(
            id,
            "cancel",
            &[SessionStatus::Scheduled, SessionStatus::Waiting, SessionStatus::InProgress],
            |s| {
                s.status = SessionStatus::Cancelled;
                s.cancellation_reason = Some(reason.to_string());
                if s.actual_start.is_some() {
                    s.actual_end = Some(Utc::now());
                }
                Ok(())
            },
        )?;
        self.release(&session);
        tracing::info!(session_id = %id, "Session cancelled");
        Ok(session)
    }

    pub fn mark_no_show(&self, id: &Uuid) -> Result<TeleconsultSession, SessionError> {
        let session = self.transition(
            id,
            "mark no-show on",
            &[SessionStatus::Scheduled, SessionStatus::Waiting],
            |s| {
                s.status = SessionStatus::NoShow;
                Ok(())
            },
        )?;
        tracing::info!(session_id = %id, "Session marked no-show");
        Ok(session)
    }

    /// Score vitals captured during the call and store them with the analysis.
    pub fn capture_vitals(&self, id: &Uuid, signs: VitalSigns) -> Result<VitalAnalysis, SessionError> {
        if let Some(field) = vitals::non_finite_field(&signs) {
            return Err(SessionError::Validation(format!("{field} must be a finite number")));
        }
        let analysis = vitals::analyze(&signs);
        self.transition(id, "capture vitals for", &[SessionStatus::InProgress], |s| {
            s.vital_signs = Some(signs.clone());
            s.vital_analysis = Some(analysis.clone());
            Ok(())
        })?;
        tracing::info!(
            session_id = %id,
            risk_score = analysis.risk_score,
            findings = analysis.alerts.len(),
            "Vitals captured"
        );
        Ok(analysis)
    }

    /// Flag a completed billable session as billed.
    pub fn mark_billed(&self, id: &Uuid) -> Result<TeleconsultSession, SessionError> {
        let session = self.store.with_tx(|tx| {
            let s = db::get_session(tx, id)?.ok_or_else(|| SessionError::session_not_found(id))?;
            if s.status != SessionStatus::Completed || !s.billable {
                return Err(SessionError::InvalidState(format!(
                    "only completed billable sessions can be billed (status {}, billable {})",
                    s.status, s.billable
                )));
            }
            db::update_session_billed(tx, id, true)?;
            db::get_session(tx, id)?.ok_or_else(|| SessionError::session_not_found(id))
        })?;
        tracing::info!(session_id = %id, "Session billed");
        Ok(session)
    }

    pub fn prescriptions(&self, session_id: &Uuid) -> Result<Vec<TelePrescription>, SessionError> {
        self.prescriptions.for_session(session_id)
    }

    // ═══════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════

    fn transition<F>(
        &self,
        id: &Uuid,
        action: &str,
        allowed: &[SessionStatus],
        apply: F,
    ) -> Result<TeleconsultSession, SessionError>
    where
        F: FnOnce(&mut TeleconsultSession) -> Result<(), SessionError>,
    {
        self.store.with_tx(|tx| {
            let mut s = db::get_session(tx, id)?.ok_or_else(|| SessionError::session_not_found(id))?;
            if !allowed.contains(&s.status) {
                return Err(SessionError::InvalidState(format!(
                    "cannot {action} a {} session",
                    s.status
                )));
            }
            let expected = s.status;
            apply(&mut s)?;
            s.updated_at = Utc::now();
            if !db::update_session(tx, &s, expected)? {
                return Err(SessionError::InvalidState("session changed concurrently".into()));
            }
            Ok(s)
        })
    }

    /// Stop sampling and close the room of a session that left in_progress.
    fn release(&self, session: &TeleconsultSession) {
        self.sampler.deactivate(&session.id);
        let (Some(provider_name), Some(room_id)) = (&session.provider_name, &session.room_id) else {
            return;
        };
        match self.providers.get(provider_name) {
            Ok(Some(provider)) => {
                if let Err(e) = provider.close_room(room_id) {
                    tracing::warn!(session_id = %session.id, room_id = %room_id, error = %e, "Failed to close room");
                }
            }
            Ok(None) => {
                tracing::warn!(session_id = %session.id, provider = %provider_name, "Provider no longer registered");
            }
            Err(e) => tracing::warn!(session_id = %session.id, error = %e, "Provider lookup failed"),
        }
    }
}

/// State is checked before consent.
fn check_startable(s: &TeleconsultSession) -> Result<(), SessionError> {
    if !s.status.can_start() {
        return Err(SessionError::InvalidState(format!("cannot start a {} session", s.status)));
    }
    if !s.consent_signed {
        return Err(SessionError::ConsentRequired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::EngineConfig;
    use crate::models::{PrescriptionRequest, PrescriptionStatus, PrescriptionType, SessionType};
    use crate::session::provider::{LocalRoomProvider, ProviderError};
    use crate::session::qos::tests::FixedQualitySource;
    use crate::signing::DigestSigner;

    struct FailingProvider;

    impl MediaProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn create_room(&self, _session: &TeleconsultSession) -> Result<String, ProviderError> {
            Err(ProviderError::RoomCreation("upstream unavailable".into()))
        }

        fn issue_access_token(&self, _user_id: &str, room_id: &str) -> Result<String, ProviderError> {
            Err(ProviderError::UnknownRoom(room_id.into()))
        }

        fn close_room(&self, room_id: &str) -> Result<(), ProviderError> {
            Err(ProviderError::UnknownRoom(room_id.into()))
        }
    }

    struct Fixture {
        manager: SessionManager,
        providers: Arc<ProviderRegistry>,
        local: Arc<LocalRoomProvider>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let providers = Arc::new(ProviderRegistry::new());
        let local = Arc::new(LocalRoomProvider::new("local"));
        providers.register(local.clone(), 10).unwrap();
        let signer = Arc::new(DigestSigner::new(b"test-secret".to_vec()));
        let sampler = QosSampler::new(
            store.clone(),
            Arc::new(FixedQualitySource {
                latency_ms: 80.0,
                packet_loss_pct: 0.1,
            }),
            &EngineConfig::default(),
        )
        .with_interval(Duration::from_millis(5));
        let manager = SessionManager::new(
            store.clone(),
            providers.clone(),
            PrescriptionService::new(store, signer),
            sampler,
        );
        Fixture {
            manager,
            providers,
            local,
        }
    }

    fn schedule(manager: &SessionManager) -> TeleconsultSession {
        let now = Utc::now();
        manager
            .create(NewSession {
                patient_id: "pat-1".into(),
                clinician_id: "dr-lee".into(),
                session_type: SessionType::FollowUp,
                scheduled_start: now + chrono::Duration::minutes(30),
                scheduled_end: now + chrono::Duration::minutes(60),
                billable: true,
            })
            .unwrap()
    }

    fn summary(prescriptions: Vec<PrescriptionRequest>) -> ClinicalSummary {
        ClinicalSummary {
            assessment: "Improving range of motion".into(),
            diagnoses: vec!["M25.561".into()],
            treatment_plan: "Continue home exercises".into(),
            prescriptions,
            follow_up_required: true,
            follow_up_date: None,
        }
    }

    fn request(name: &str) -> PrescriptionRequest {
        PrescriptionRequest {
            prescription_type: PrescriptionType::Exercise,
            name: name.into(),
            dosage: "3 sets of 10".into(),
            frequency: "daily".into(),
            duration_days: 14,
            instructions: "stop if pain exceeds 6".into(),
            warnings: Vec::new(),
        }
    }

    fn started(f: &Fixture) -> SessionStart {
        let s = schedule(&f.manager);
        f.manager.record_consent(&s.id).unwrap();
        f.manager.start(&s.id).unwrap()
    }

    #[test]
    fn create_rejects_bad_schedule() {
        let f = fixture();
        let now = Utc::now();
        let past = NewSession {
            patient_id: "pat-1".into(),
            clinician_id: "dr-lee".into(),
            session_type: SessionType::Initial,
            scheduled_start: now - chrono::Duration::minutes(5),
            scheduled_end: now + chrono::Duration::minutes(30),
            billable: false,
        };
        assert!(matches!(f.manager.create(past.clone()), Err(SessionError::Validation(_))));

        let inverted = NewSession {
            scheduled_start: now + chrono::Duration::minutes(30),
            scheduled_end: now + chrono::Duration::minutes(10),
            ..past
        };
        assert!(matches!(f.manager.create(inverted), Err(SessionError::Validation(_))));
    }

    #[test]
    fn start_requires_consent_regardless_of_providers() {
        let f = fixture();
        let s = schedule(&f.manager);
        assert!(matches!(f.manager.start(&s.id), Err(SessionError::ConsentRequired)));

        f.providers.set_active("local", false).unwrap();
        assert!(matches!(f.manager.start(&s.id), Err(SessionError::ConsentRequired)));
        assert_eq!(f.manager.get(&s.id).unwrap().status, SessionStatus::Scheduled);
    }

    #[test]
    fn start_opens_room_and_issues_tokens() {
        let f = fixture();
        let s = schedule(&f.manager);
        f.manager.join_waiting_room(&s.id).unwrap();
        f.manager.record_consent(&s.id).unwrap();

        let start = f.manager.start(&s.id).unwrap();
        assert_eq!(start.session.status, SessionStatus::InProgress);
        assert!(start.session.actual_start.is_some());
        assert_eq!(start.provider, "local");
        assert_eq!(start.session.room_id.as_deref(), Some(start.room_id.as_str()));
        assert_ne!(start.patient_token, start.clinician_token);
        assert_eq!(f.local.open_rooms(), 1);
    }

    #[test]
    fn start_from_non_startable_state_leaves_session_unchanged() {
        let f = fixture();
        let s = schedule(&f.manager);
        f.manager.record_consent(&s.id).unwrap();
        f.manager.cancel(&s.id, "patient rescheduled").unwrap();
        let before = f.manager.get(&s.id).unwrap();

        assert!(matches!(f.manager.start(&s.id), Err(SessionError::InvalidState(_))));
        assert_eq!(f.manager.get(&s.id).unwrap(), before);
        assert_eq!(f.local.open_rooms(), 0);

        let live = started(&f);
        assert!(matches!(f.manager.start(&live.session.id), Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn state_is_checked_before_consent() {
        let f = fixture();
        let s = schedule(&f.manager);
        f.manager.mark_no_show(&s.id).unwrap();
        assert!(matches!(f.manager.start(&s.id), Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn failing_provider_falls_through_by_priority() {
        let f = fixture();
        f.providers.register(Arc::new(FailingProvider), 100).unwrap();
        let start = started(&f);
        assert_eq!(start.provider, "local");

        f.providers.set_active("local", false).unwrap();
        let s = schedule(&f.manager);
        f.manager.record_consent(&s.id).unwrap();
        assert!(matches!(f.manager.start(&s.id), Err(SessionError::NoProviderAvailable)));
        assert_eq!(f.manager.get(&s.id).unwrap().status, SessionStatus::Scheduled);
    }

    #[test]
    fn end_without_summary_fails() {
        let f = fixture();
        let start = started(&f);
        let id = start.session.id;

        assert!(matches!(f.manager.end(&id, None), Err(SessionError::Validation(_))));
        let blank = ClinicalSummary {
            assessment: "   ".into(),
            ..summary(Vec::new())
        };
        assert!(matches!(f.manager.end(&id, Some(blank)), Err(SessionError::Validation(_))));
        assert_eq!(f.manager.get(&id).unwrap().status, SessionStatus::InProgress);
        assert!(f.manager.prescriptions(&id).unwrap().is_empty());
    }

    #[test]
    fn end_completes_and_signs_each_prescription() {
        let f = fixture();
        let start = started(&f);
        let id = start.session.id;

        let closed = f
            .manager
            .end(&id, Some(summary(vec![request("Quad sets"), request("Heel slides")])))
            .unwrap();
        let session = closed.session;
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.actual_end.is_some());
        assert!(session.duration_secs.unwrap() >= 0);
        assert_eq!(session.assessment.as_deref(), Some("Improving range of motion"));
        assert_eq!(session.diagnoses, vec!["M25.561"]);

        let stored = f.manager.prescriptions(&id).unwrap();
        assert_eq!(stored.len(), 2);
        for p in &stored {
            assert_eq!(p.signed_by, "dr-lee");
            assert_eq!(p.status, PrescriptionStatus::Active);
            assert!(f.manager.prescriptions.verify(p));
        }
        assert_eq!(f.local.open_rooms(), 0);
        assert_eq!(f.manager.get(&id).unwrap(), session);
    }

    #[test]
    fn terminal_sessions_accept_no_transition() {
        let f = fixture();
        let start = started(&f);
        let id = start.session.id;
        f.manager.end(&id, Some(summary(Vec::new()))).unwrap();

        assert!(matches!(f.manager.end(&id, Some(summary(Vec::new()))), Err(SessionError::InvalidState(_))));
        assert!(matches!(f.manager.cancel(&id, "late"), Err(SessionError::InvalidState(_))));
        assert!(matches!(f.manager.mark_no_show(&id), Err(SessionError::InvalidState(_))));
        assert!(matches!(f.manager.join_waiting_room(&id), Err(SessionError::InvalidState(_))));
        assert!(matches!(f.manager.record_consent(&id), Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn cancel_in_progress_closes_room() {
        let f = fixture();
        let start = started(&f);
        assert_eq!(f.local.open_rooms(), 1);

        assert!(matches!(f.manager.cancel(&start.session.id, " "), Err(SessionError::Validation(_))));
        let cancelled = f.manager.cancel(&start.session.id, "connection lost").unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("connection lost"));
        assert!(cancelled.actual_end.is_some());
        assert_eq!(f.local.open_rooms(), 0);
    }

    #[test]
    fn vitals_only_captured_in_progress() {
        let f = fixture();
        let s = schedule(&f.manager);
        let low_oxygen = VitalSigns {
            oxygen_saturation: Some(88.0),
            ..Default::default()
        };
        assert!(matches!(
            f.manager.capture_vitals(&s.id, low_oxygen.clone()),
            Err(SessionError::InvalidState(_))
        ));

        let start = started(&f);
        let nan_pulse = VitalSigns {
            heart_rate: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            f.manager.capture_vitals(&start.session.id, nan_pulse),
            Err(SessionError::Validation(_))
        ));
        assert!(f.manager.get(&start.session.id).unwrap().vital_signs.is_none());

        let analysis = f.manager.capture_vitals(&start.session.id, low_oxygen.clone()).unwrap();
        assert!(analysis.risk_score >= 40);
        let stored = f.manager.get(&start.session.id).unwrap();
        assert_eq!(stored.vital_signs, Some(low_oxygen));
        assert_eq!(stored.vital_analysis, Some(analysis));
    }

    #[test]
    fn billing_requires_completed_billable_session() {
        let f = fixture();
        let start = started(&f);
        let id = start.session.id;
        assert!(matches!(f.manager.mark_billed(&id), Err(SessionError::InvalidState(_))));

        f.manager.end(&id, Some(summary(Vec::new()))).unwrap();
        assert!(f.manager.mark_billed(&id).unwrap().billed);
    }

    #[test]
    fn unknown_session_not_found() {
        let f = fixture();
        assert!(matches!(
            f.manager.start(&Uuid::new_v4()),
            Err(SessionError::NotFound { entity: "session", .. })
        ));
    }

    #[tokio::test]
    async fn sampler_runs_only_while_in_progress() {
        let f = fixture();
        let start = started(&f);
        let id = start.session.id;
        assert!(f.manager.sampler().is_active(&id));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.manager.get(&id).unwrap().connection_quality.is_some());

        f.manager.end(&id, Some(summary(Vec::new()))).unwrap();
        assert!(!f.manager.sampler().is_active(&id));
    }
}
