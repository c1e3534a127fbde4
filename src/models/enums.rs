use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Teleconsult sessions ────────────────────────────────────────────────────

str_enum!(SessionType {
    Initial => "initial",
    FollowUp => "follow_up",
    Assessment => "assessment",
    TherapySession => "therapy_session",
    Emergency => "emergency",
});

str_enum!(SessionStatus {
    Scheduled => "scheduled",
    Waiting => "waiting",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
});

impl SessionStatus {
    /// Completed, cancelled and no-show sessions accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// States from which a session may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Waiting)
    }
}

str_enum!(PrescriptionType {
    Medication => "medication",
    Exercise => "exercise",
    Therapy => "therapy",
    Other => "other",
});

str_enum!(PrescriptionStatus {
    Active => "active",
    Cancelled => "cancelled",
    Expired => "expired",
});

str_enum!(ConnectionGrade {
    Excellent => "excellent",
    Good => "good",
    Fair => "fair",
    Poor => "poor",
});

// ── Remote monitoring ───────────────────────────────────────────────────────

str_enum!(ProgramType {
    VitalSigns => "vital_signs",
    ExerciseCompliance => "exercise_compliance",
    PainTracking => "pain_tracking",
    MovementAnalysis => "movement_analysis",
});

str_enum!(ProgramStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl ProgramStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

str_enum!(Connectivity {
    Connected => "connected",
    Disconnected => "disconnected",
});

str_enum!(Reliability {
    High => "high",
    Medium => "medium",
    Low => "low",
});

str_enum!(AlertCondition {
    Above => "above",
    Below => "below",
    Equals => "equals",
    Change => "change",
    Missing => "missing",
});

str_enum!(AlertSeverity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl AlertSeverity {
    /// High and critical alerts require immediate clinical attention.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

str_enum!(ActionKind {
    NotifyClinician => "notify_clinician",
    NotifyPatient => "notify_patient",
    CreateTask => "create_task",
    ScheduleCall => "schedule_call",
    EmergencyProtocol => "emergency_protocol",
});

str_enum!(AlertStatus {
    Active => "active",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
    FalsePositive => "false_positive",
});
