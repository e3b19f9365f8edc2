//! # Channel Models
//!
//! Classical channels deliver messages reliably and in order after a fixed
//! delay; quantum channels additionally attenuate, losing each photon with
//! probability `1 - 10^(-attenuation * length / 10)`. Delays derive from span
//! length through the kernel's exact rational helper, never from floats.

use rand::Rng;
use rand_chacha::ChaCha20Rng;

use crate::kernel::{precise_delay_ps, SimTime};
use crate::FIBER_LIGHT_SPEED_M_S;

/// One-directional classical link between two nodes.
#[derive(Debug, Clone)]
pub struct ClassicalChannel {
    pub name: String,
    pub sender: String,
    pub receiver: String,
    pub length_m: f64,
    pub delay_ps: SimTime,
}

impl ClassicalChannel {
    /// Channel with an explicit delay (topology `cconnections` entries).
    pub fn with_delay(name: String, sender: String, receiver: String, delay_ps: SimTime) -> Self {
        Self {
            name,
            sender,
            receiver,
            length_m: 0.0,
            delay_ps,
        }
    }

    /// Channel whose delay follows from fiber length.
    pub fn from_length(name: String, sender: String, receiver: String, length_m: f64) -> Self {
        let delay_ps = precise_delay_ps(length_m, FIBER_LIGHT_SPEED_M_S);
        Self {
            name,
            sender,
            receiver,
            length_m,
            delay_ps,
        }
    }
}

/// One-directional quantum link between a node and its middle/peer node.
#[derive(Debug)]
pub struct QuantumChannel {
    pub name: String,
    pub sender: String,
    pub receiver: String,
    pub length_m: f64,
    pub attenuation_db_per_m: f64,
    pub polarization_fidelity: f64,
    pub frequency_hz: f64,
    pub delay_ps: SimTime,
    rng: ChaCha20Rng,
}

impl QuantumChannel {
    pub fn new(
        name: String,
        sender: String,
        receiver: String,
        length_m: f64,
        attenuation_db_per_m: f64,
        polarization_fidelity: f64,
        rng: ChaCha20Rng,
    ) -> Self {
        let delay_ps = precise_delay_ps(length_m, FIBER_LIGHT_SPEED_M_S);
        Self {
            name,
            sender,
            receiver,
            length_m,
            attenuation_db_per_m,
            polarization_fidelity,
            frequency_hz: 8e7,
            delay_ps,
            rng,
        }
    }

    /// Probability that a transmitted photon survives the span.
    pub fn survival_probability(&self) -> f64 {
        10f64.powf(-self.attenuation_db_per_m * self.length_m / 10.0)
    }

    /// Roll channel loss for one photon. Lost photons never schedule arrival.
    pub fn photon_survives(&mut self) -> bool {
        let p = self.survival_probability();
        p >= 1.0 || self.rng.gen::<f64>() < p
    }

    /// Roll a polarization error for one detected QKD pulse.
    pub fn polarization_flip(&mut self) -> bool {
        self.rng.gen::<f64>() >= self.polarization_fidelity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::derive_entity_rng;

    #[test]
    fn test_classical_delay_from_length() {
        let channel = ClassicalChannel::from_length(
            "cc.r1.r2".to_string(),
            "r1".to_string(),
            "r2".to_string(),
            1000.0,
        );
        assert_eq!(channel.delay_ps, 5_000_000);
    }

    #[test]
    fn test_lossless_channel_always_survives() {
        let mut channel = QuantumChannel::new(
            "qc.r1.m1".to_string(),
            "r1".to_string(),
            "m1".to_string(),
            1000.0,
            0.0,
            1.0,
            derive_entity_rng(0, "qc.r1.m1"),
        );
        assert!((channel.survival_probability() - 1.0).abs() < 1e-12);
        for _ in 0..100 {
            assert!(channel.photon_survives());
        }
    }

    #[test]
    fn test_attenuated_channel_loses_photons() {
        // 0.02 dB/m over 1 km is 20 dB: 1% survival
        let mut channel = QuantumChannel::new(
            "qc.r1.m1".to_string(),
            "r1".to_string(),
            "m1".to_string(),
            1000.0,
            0.02,
            1.0,
            derive_entity_rng(7, "qc.r1.m1"),
        );
        assert!((channel.survival_probability() - 0.01).abs() < 1e-9);
        let survived = (0..10_000).filter(|_| channel.photon_survives()).count();
        assert!(survived < 300, "survived {survived} of 10000 at 1% loss");
    }

    #[test]
    fn test_polarization_fidelity_flip_rate() {
        let mut channel = QuantumChannel::new(
            "qc.a.b".to_string(),
            "a".to_string(),
            "b".to_string(),
            1.0,
            0.0,
            0.97,
            derive_entity_rng(3, "qc.a.b"),
        );
        let flips = (0..10_000).filter(|_| channel.polarization_flip()).count();
        assert!((200..400).contains(&flips), "flips {flips} of 10000 at 3%");
    }
}
