//! # AIMD Admission Window
//!
//! Additive-increase / multiplicative-decrease controller for the global
//! per-session admission window consumed by the fair scheduler. Successes
//! grow the window linearly; backoff events shrink it multiplicatively.

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::sync::Mutex;

/// AIMD parameters.
#[derive(Debug, Clone)]
pub struct AimdConfig {
    pub min_window: f64,
    pub max_window: f64,
    /// Added to the window on success.
    pub increase: f64,
    /// Window multiplier on backoff, in (0, 1).
    pub decrease: f64,
    pub initial_window: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        AimdConfig {
            min_window: 1.0,
            max_window: 64.0,
            increase: 1.0,
            decrease: 0.5,
            initial_window: 8.0,
        }
    }
}

/// Shared admission-window controller.
#[derive(Debug)]
pub struct AimdController {
    window: Mutex<f64>,
    config: AimdConfig,
}

static GLOBAL: Lazy<Arc<AimdController>> =
    Lazy::new(|| Arc::new(AimdController::new(AimdConfig::default())));

impl AimdController {
    pub fn new(config: AimdConfig) -> Self {
        AimdController {
            window: Mutex::new(config.initial_window.clamp(config.min_window, config.max_window)),
            config,
        }
    }

    /// Fixed-window controller, useful for tests and manual tuning.
    pub fn fixed(window: u32) -> Self {
        AimdController::new(AimdConfig {
            min_window: window as f64,
            max_window: window as f64,
            initial_window: window as f64,
            ..AimdConfig::default()
        })
    }

    /// The process-wide controller.
    pub fn global() -> Arc<AimdController> {
        Arc::clone(&GLOBAL)
    }

    /// Current admission window (per-session in-flight cap).
    pub fn get(&self) -> u32 {
        self.window
            .lock()
            .map(|w| w.floor().max(0.0) as u32)
            .unwrap_or(1)
    }

    /// Administrative override, clamped to the configured bounds.
    pub fn set(&self, window: f64) {
        if let Ok(mut current) = self.window.lock() {
            *current = window.clamp(self.config.min_window, self.config.max_window);
        }
    }

    pub fn on_success(&self) {
        if let Ok(mut window) = self.window.lock() {
            *window = (*window + self.config.increase).min(self.config.max_window);
        }
    }

    pub fn on_backoff(&self) {
        if let Ok(mut window) = self.window.lock() {
            *window = (*window * self.config.decrease).max(self.config.min_window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_increase() {
        let aimd = AimdController::new(AimdConfig {
            initial_window: 2.0,
            ..AimdConfig::default()
        });
        aimd.on_success();
        aimd.on_success();
        assert_eq!(aimd.get(), 4);
    }

    #[test]
    fn multiplicative_decrease() {
        let aimd = AimdController::new(AimdConfig {
            initial_window: 16.0,
            ..AimdConfig::default()
        });
        aimd.on_backoff();
        assert_eq!(aimd.get(), 8);
        aimd.on_backoff();
        assert_eq!(aimd.get(), 4);
    }

    #[test]
    fn window_respects_bounds() {
        let aimd = AimdController::new(AimdConfig {
            min_window: 2.0,
            max_window: 4.0,
            initial_window: 3.0,
            ..AimdConfig::default()
        });
        for _ in 0..10 {
            aimd.on_success();
        }
        assert_eq!(aimd.get(), 4);
        for _ in 0..10 {
            aimd.on_backoff();
        }
        assert_eq!(aimd.get(), 2);
    }

    #[test]
    fn fixed_window_never_moves() {
        let aimd = AimdController::fixed(3);
        aimd.on_success();
        aimd.on_backoff();
        aimd.set(100.0);
        assert_eq!(aimd.get(), 3);
    }

    #[test]
    fn gated_controller_opens_on_set() {
        let aimd = AimdController::new(AimdConfig {
            min_window: 0.0,
            max_window: 100.0,
            initial_window: 0.0,
            ..AimdConfig::default()
        });
        assert_eq!(aimd.get(), 0);
        aimd.set(10.0);
        assert_eq!(aimd.get(), 10);
    }
}
