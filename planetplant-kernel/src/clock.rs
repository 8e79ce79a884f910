/**
 * HORLOGE - Source unique du temps "mur" pour registre, moteur et santé
 *
 * RÔLE : Les fenêtres d'inactivité, le cooldown, le quota journalier et les
 * heures calmes dépendent de l'heure réelle au moment de la décision. Tout
 * passe par le trait `Clock` pour que les tests avancent le temps à la main.
 *
 * L'heure "locale" est l'heure UTC décalée de l'offset configuré
 * (`engine.utc_offset_hours`) : pas de lecture du fuseau système.
 */

use parking_lot::Mutex;
use std::sync::Arc;
use time::{Duration, OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    /// Instant courant, exprimé dans l'offset local du kernel
    fn now(&self) -> OffsetDateTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Horloge système avec offset fixe
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Construit l'horloge depuis un nombre d'heures (ex: 1 pour UTC+1)
    pub fn with_offset_hours(hours: i8) -> Self {
        let offset = UtcOffset::from_hms(hours, 0, 0).unwrap_or(UtcOffset::UTC);
        Self::new(offset)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Horloge pilotée à la main (tests, simulations)
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-05-01 10:00 UTC));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), datetime!(2024-05-01 11:30 UTC));
    }

    #[test]
    fn system_clock_applies_offset() {
        let clock = SystemClock::with_offset_hours(2);
        assert_eq!(clock.now().offset(), UtcOffset::from_hms(2, 0, 0).unwrap());
    }
}
