use strum::{Display, EnumIter, EnumString};

/// Optimization and safety tunables attached to every node by the front
/// end. Each quality ranges over `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Policy {
    pub speed: u8,
    pub space: u8,
    pub safety: u8,
    pub debug: u8,
    pub compilation_speed: u8,
    pub inhibit_warnings: u8,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            speed: 1,
            space: 1,
            safety: 1,
            debug: 1,
            compilation_speed: 1,
            inhibit_warnings: 1,
        }
    }
}

/// The coarse bucket a policy resolves to. Templates carry the same
/// classification to say which buckets may use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum SafetyClass {
    /// No checking, optimize for speed
    Fast,
    /// No checking, optimize for space
    Small,
    /// Check everything that could corrupt memory, but trust the rest
    FastSafe,
    /// Check every error the generic operation would signal
    Safe,
}

impl SafetyClass {
    /// Whether a node resolved to `self` may use a template classified as
    /// `template`
    pub fn admits(self, template: SafetyClass) -> bool {
        match (self, template) {
            (_, SafetyClass::Safe) => true,
            (SafetyClass::Safe | SafetyClass::FastSafe, SafetyClass::FastSafe) => true,
            (SafetyClass::Safe | SafetyClass::FastSafe, _) => false,
            (SafetyClass::Fast | SafetyClass::Small, _) => true,
        }
    }
}

/// Generates `with_<quality>` setters that clamp the value to `0..=3`
macro_rules! policy_setters {
    ($($quality:ident),* $(,)?) => {
        paste::paste! {
            impl Policy {
                $(
                    pub fn [<with_ $quality>](mut self, value: u8) -> Self {
                        self.$quality = value.min(3);
                        self
                    }
                )*
            }
        }
    };
}

policy_setters!(speed, space, safety, debug, compilation_speed, inhibit_warnings);

impl Policy {
    pub fn fast() -> Self {
        Self {
            speed: 3,
            safety: 0,
            ..Default::default()
        }
    }

    pub fn safe() -> Self {
        Self {
            safety: 3,
            ..Default::default()
        }
    }

    /// Resolves the policy to the bucket used for template selection.
    /// Compilation speed counts as space since slow compiles and large code
    /// come from the same inline expansions.
    pub fn bucket(&self) -> SafetyClass {
        let space = self.space.max(self.compilation_speed);

        if self.safety == 0 {
            if self.speed >= space {
                SafetyClass::Fast
            } else {
                SafetyClass::Small
            }
        } else if self.speed >= space && self.speed >= self.safety {
            SafetyClass::FastSafe
        } else {
            SafetyClass::Safe
        }
    }

    /// Type checks may be weakened to a cheaper supertype unless safety
    /// dominates every other quality
    pub fn weakens_checks(&self) -> bool {
        !(self.speed <= self.safety
            && self.space <= self.safety
            && self.compilation_speed <= self.safety)
    }

    /// Zero safety drops checks that the consumer would not do anyway
    pub fn drops_checks(&self) -> bool {
        self.safety == 0
    }

    pub fn notes_enabled(&self) -> bool {
        self.inhibit_warnings < 3
    }

    /// Efficiency notes only matter when speed is valued over quiet output
    pub fn efficiency_notes_enabled(&self) -> bool {
        self.speed > self.inhibit_warnings
    }

    /// Notes about checks that can not be done are worth showing only when
    /// safety is at least as important as silence
    pub fn check_notes_enabled(&self) -> bool {
        self.safety >= self.inhibit_warnings && self.notes_enabled()
    }

    /// Tail calls are kept unless the user wants every frame for debugging
    pub fn allows_tail_calls(&self) -> bool {
        self.debug < 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fast_safe() {
        assert_eq!(Policy::default().bucket(), SafetyClass::FastSafe);
        assert_eq!(Policy::fast().bucket(), SafetyClass::Fast);
        assert_eq!(Policy::safe().bucket(), SafetyClass::Safe);
    }

    #[test]
    fn space_beats_speed_without_safety() {
        let policy = Policy {
            safety: 0,
            space: 3,
            ..Default::default()
        };

        assert_eq!(policy.bucket(), SafetyClass::Small);
    }

    #[test]
    fn safe_buckets_only_admit_checking_templates() {
        assert!(SafetyClass::Safe.admits(SafetyClass::Safe));
        assert!(SafetyClass::Safe.admits(SafetyClass::FastSafe));
        assert!(SafetyClass::FastSafe.admits(SafetyClass::FastSafe));
        assert!(SafetyClass::FastSafe.admits(SafetyClass::Safe));
        assert!(!SafetyClass::FastSafe.admits(SafetyClass::Fast));
        assert!(!SafetyClass::Safe.admits(SafetyClass::Small));
        assert!(SafetyClass::Small.admits(SafetyClass::Fast));
    }

    #[test]
    fn setters_clamp_to_three() {
        let policy = Policy::default().with_speed(9).with_debug(0);

        assert_eq!(policy.speed, 3);
        assert_eq!(policy.debug, 0);
        assert!(policy.allows_tail_calls());
    }

    #[test]
    fn safety_three_keeps_full_checks() {
        assert!(!Policy::safe().weakens_checks());
        assert!(Policy::fast().weakens_checks());
    }
}
