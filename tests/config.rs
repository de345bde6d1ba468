// Tests for configuration loading and runtime settings.

use std::time::Duration;

use uuid::Uuid;

use overseer::channel::NotificationChannel;
use overseer::config::{self, ApplicationSettings, Config, SettingsProvider, SharedSettings};
use overseer::error::ConfigError;
use overseer::model::Notification;

fn with_rate(rate: f64) -> ApplicationSettings {
    ApplicationSettings {
        frame_capture_rate: rate,
        ..ApplicationSettings::default()
    }
}

#[test]
fn test_capture_interval_follows_rate() {
    assert_eq!(with_rate(0.5).capture_interval(), Duration::from_secs(2));
    assert_eq!(with_rate(10.0).capture_interval(), Duration::from_millis(100));
}

#[test]
fn test_capture_interval_falls_back_on_unusable_rates() {
    let default = Duration::from_secs(2);
    for rate in [1e-30, f64::INFINITY, f64::NAN, 0.0, -1.0, 1e9] {
        assert_eq!(
            with_rate(rate).capture_interval(),
            default,
            "rate {} should use the default interval",
            rate
        );
    }
}

#[test]
fn test_frame_capture_rate_bounds() {
    assert!(config::is_valid_frame_capture_rate(0.5));
    assert!(config::is_valid_frame_capture_rate(
        config::constants::MAX_FRAME_CAPTURE_RATE
    ));
    assert!(!config::is_valid_frame_capture_rate(1e-30));
    assert!(!config::is_valid_frame_capture_rate(f64::INFINITY));
    assert!(!config::is_valid_frame_capture_rate(f64::NAN));
}

// The only test touching the process environment, so no other test races it.
#[test]
fn test_load_rejects_unusable_frame_capture_rates() {
    const VAR: &str = "OVERSEER_FRAME_CAPTURE_RATE";

    for raw in ["1e-30", "inf", "NaN", "0", "-2"] {
        unsafe { std::env::set_var(VAR, raw) };
        let result = Config::load();
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == VAR),
            "{} should be rejected, got {:?}",
            raw,
            result.map(|c| c.settings.frame_capture_rate)
        );
    }

    unsafe { std::env::set_var(VAR, "2") };
    let config = Config::load().unwrap();
    assert_eq!(config.settings.capture_interval(), Duration::from_millis(500));

    unsafe { std::env::remove_var(VAR) };
}

#[test]
fn test_settings_update_announces_changes() {
    let notifications = NotificationChannel::new("notifications");
    let reader = Uuid::new_v4();
    notifications.subscribe(reader);
    let settings =
        SharedSettings::with_notifications(ApplicationSettings::default(), notifications.clone());

    assert!(settings.update(|s| s.poll_interval = Duration::from_secs(1)));
    assert_eq!(settings.settings().poll_interval, Duration::from_secs(1));
    assert!(matches!(
        notifications.try_read(reader).unwrap(),
        Some(Notification::SettingsChanged)
    ));

    // An edit that changes nothing stays quiet.
    assert!(!settings.update(|s| s.poll_interval = Duration::from_secs(1)));
    assert!(notifications.try_read(reader).unwrap().is_none());
}
