use std::collections::HashMap;
use std::sync::RwLock;

/// Speaking rate used when a user has no usable preference.
pub const DEFAULT_VOICE_SPEED: f32 = 1.0;

/// Process-wide map of per-user speaking rates.
#[derive(Debug, Default)]
pub struct VoicePreferences {
    speeds: RwLock<HashMap<String, f32>>,
}

impl VoicePreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the user's rate, or 1.0 when absent or not positive.
    pub fn speed(&self, user_id: &str) -> f32 {
        self.speeds
            .read()
            .ok()
            .and_then(|speeds| speeds.get(user_id).copied())
            .filter(|speed| *speed > 0.0)
            .unwrap_or(DEFAULT_VOICE_SPEED)
    }

    /// Records a new rate and returns the effective value.
    pub fn update(&self, user_id: &str, speed: f32) -> f32 {
        if let Ok(mut speeds) = self.speeds.write() {
            speeds.insert(user_id.to_string(), speed);
        }
        self.speed(user_id)
    }
}
