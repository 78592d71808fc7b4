//! Status helper enums mapping to SMALLSERIAL lookup tables.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table.

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// The `name` column of the lookup table.
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Generation task lifecycle status.
    TaskStatus {
        Pending = 1 => "pending",
        Rendering = 2 => "rendering",
        Submitted = 3 => "submitted",
        Running = 4 => "running",
        Completed = 5 => "completed",
        Failed = 6 => "failed",
        TimedOut = 7 => "timed_out",
    }
}

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] =
        [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::TimedOut];

    pub const ACTIVE: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Rendering,
        TaskStatus::Submitted,
        TaskStatus::Running,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Statuses a task may move to `self` from.
    ///
    /// Terminal statuses accept any active status, so a failure at any
    /// step lands directly in `failed` (or `timed_out`).
    pub fn allowed_predecessors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Rendering => &[TaskStatus::Pending],
            TaskStatus::Submitted => &[TaskStatus::Rendering],
            TaskStatus::Running => &[TaskStatus::Submitted],
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut => &Self::ACTIVE,
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_match_seed_order() {
        assert_eq!(TaskStatus::Pending.id(), 1);
        assert_eq!(TaskStatus::Completed.id(), 5);
        assert_eq!(TaskStatus::TimedOut.id(), 7);
    }

    #[test]
    fn from_id_round_trips() {
        for id in 1..=7 {
            assert_eq!(TaskStatus::from_id(id).unwrap().id(), id);
        }
        assert!(TaskStatus::from_id(0).is_none());
        assert!(TaskStatus::from_id(8).is_none());
    }

    #[test]
    fn forward_chain_is_strict() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Rendering));
        assert!(TaskStatus::Rendering.can_transition_to(TaskStatus::Submitted));
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Submitted));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Rendering));
    }

    #[test]
    fn terminal_statuses_are_final() {
        for terminal in TaskStatus::TERMINAL {
            for next in TaskStatus::TERMINAL {
                assert!(!terminal.can_transition_to(next));
            }
            assert!(terminal.is_terminal());
        }
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::TimedOut));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn serializes_as_name() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }
}
