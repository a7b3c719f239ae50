//! Physical and numerical constants.
//!
//! The crate works in a single unit system: positions in Angstrom, energies in
//! electron-volts, masses in atomic mass units, time in femtoseconds and
//! charges in elementary charges. Measured values follow CODATA 2010.

/// Square root of 2.
pub const SQRT2: f64 = std::f64::consts::SQRT_2;

/// Energy returned to force a move or step to be rejected.
pub const HUGE_NUM: f64 = 1.0e50;

/// Angstroms per meter.
pub const M_TO_ANG: f64 = 1.0e10;

/// Pascal per atmosphere.
pub const ATM_TO_PA: f64 = 1.01325e5;

/// Vacuum permittivity (F/m).
pub const EPS_ZERO: f64 = 8.854_187_817e-12;

/// Reduced Planck constant (eV·s).
pub const HBAR: f64 = 6.582_119_28e-16;

/// Boltzmann constant (eV/K).
pub const K_BOLTZ: f64 = 8.617_332_4e-5;

/// Atomic mass unit in kilograms.
pub const AMU_TO_KG: f64 = 1.660_538_921e-27;

/// Joules to electron-volts.
pub const SI_TO_EV: f64 = 1.0 / 1.602_176_565e-19;

/// Electron rest mass (kg).
pub const ELECTRON_MASS_KG: f64 = 9.109_382_91e-31;

/// Bohr radius in Angstrom.
pub const BOHR_RAD: f64 = 0.529_177_210_92;

/// Hartree to electron-volts.
pub const HAR_TO_EV: f64 = 27.211_385_05;

/// Coulomb constant in eV·Å/e², so that `C2EV * q1 * q2 / r` is an energy in eV.
pub const C2EV: f64 = M_TO_ANG / (4.0 * std::f64::consts::PI * SI_TO_EV * EPS_ZERO);

/// Electron mass in amu.
pub const ELEC_MASS: f64 = ELECTRON_MASS_KG / AMU_TO_KG;

/// Converts amu·Å²/s² to eV (ring-polymer spring energies).
pub const TO_EV: f64 = AMU_TO_KG * SI_TO_EV / (M_TO_ANG * M_TO_ANG);

/// Converts amu·Å²/fs² to eV (kinetic energies in the integrator).
pub const AMU_ANG2_FS2_TO_EV: f64 = TO_EV * 1.0e30;

/// Converts atm·Å³ to eV.
pub const ATM_TO_EV: f64 = SI_TO_EV * ATM_TO_PA / (M_TO_ANG * M_TO_ANG * M_TO_ANG);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn coulomb_constant_matches_reference() {
        assert_relative_eq!(C2EV, 14.399_645, epsilon = 1e-4);
    }

    #[test]
    fn electron_mass_in_amu() {
        assert_relative_eq!(ELEC_MASS, 5.485_799e-4, epsilon = 1e-9);
    }

    #[test]
    fn kinetic_conversion() {
        // 1 amu moving at 1 Å/fs carries ~51.8 eV of kinetic energy
        assert_relative_eq!(0.5 * AMU_ANG2_FS2_TO_EV, 51.821, epsilon = 1e-2);
    }
}
