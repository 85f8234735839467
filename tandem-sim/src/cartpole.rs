//! Deterministic kinematic cart-pole driver.
//!
//! The in-tree stand-in for MuJoCo/PyBullet: a fixed-timestep, closed-form
//! cart-pole integrator with a grayscale renderer, so the whole plane runs
//! and tests end-to-end without an engine installed. Determinism rules:
//! no wall clock, no ambient randomness, state advances only in `step`.

use std::time::Duration;

use crate::driver::{DriverError, EngineDriver, EngineState};

const GRAVITY: f64 = 9.81;
const CART_MASS: f64 = 1.0;
const POLE_MASS: f64 = 0.1;
const POLE_HALF_LEN: f64 = 0.5;
const TIMESTEP: f64 = 1.0 / 60.0;

/// Cart-pole physics plus a tiny PGM renderer.
pub struct CartpoleDriver {
    loaded: bool,
    width: u32,
    height: u32,
    sim_time: f64,
    /// Cart position, cart velocity, pole angle, pole angular velocity.
    x: f64,
    x_dot: f64,
    theta: f64,
    theta_dot: f64,
    /// Fails the next `n` calls; test hook for degradation paths.
    pub fail_next: u32,
}

impl CartpoleDriver {
    pub fn new() -> Self {
        Self {
            loaded: false,
            width: 0,
            height: 0,
            sim_time: 0.0,
            x: 0.0,
            x_dot: 0.0,
            theta: 0.05,
            theta_dot: 0.0,
            fail_next: 0,
        }
    }

    fn state(&self) -> EngineState {
        EngineState {
            sim_time: self.sim_time,
            positions: vec![self.x, self.theta],
            velocities: vec![self.x_dot, self.theta_dot],
        }
    }

    fn check(&mut self, op: &str) -> Result<(), DriverError> {
        if !self.loaded {
            return Err(DriverError::Call(format!("{op} before load")));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(DriverError::Call(format!("injected {op} failure")));
        }
        Ok(())
    }
}

impl Default for CartpoleDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineDriver for CartpoleDriver {
    fn load(
        &mut self,
        model_ref: &str,
        width: u32,
        height: u32,
        _headless: bool,
    ) -> Result<(), DriverError> {
        if model_ref.trim().is_empty() {
            return Err(DriverError::BadModel("empty model reference".to_string()));
        }
        if width == 0 || height == 0 {
            return Err(DriverError::BadModel(format!(
                "render dimensions {width}x{height}"
            )));
        }
        self.width = width;
        self.height = height;
        self.loaded = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<EngineState, DriverError> {
        self.check("reset")?;
        self.sim_time = 0.0;
        self.x = 0.0;
        self.x_dot = 0.0;
        self.theta = 0.05;
        self.theta_dot = 0.0;
        Ok(self.state())
    }

    fn step(&mut self, action: &[f64]) -> Result<EngineState, DriverError> {
        self.check("step")?;
        let force = action.first().copied().unwrap_or(0.0).clamp(-10.0, 10.0);

        // Standard cart-pole dynamics, semi-implicit Euler.
        let total_mass = CART_MASS + POLE_MASS;
        let cos_t = self.theta.cos();
        let sin_t = self.theta.sin();
        let temp =
            (force + POLE_MASS * POLE_HALF_LEN * self.theta_dot.powi(2) * sin_t) / total_mass;
        let theta_acc = (GRAVITY * sin_t - cos_t * temp)
            / (POLE_HALF_LEN * (4.0 / 3.0 - POLE_MASS * cos_t.powi(2) / total_mass));
        let x_acc = temp - POLE_MASS * POLE_HALF_LEN * theta_acc * cos_t / total_mass;

        self.x_dot += x_acc * TIMESTEP;
        self.x += self.x_dot * TIMESTEP;
        self.theta_dot += theta_acc * TIMESTEP;
        self.theta += self.theta_dot * TIMESTEP;
        self.sim_time += TIMESTEP;
        Ok(self.state())
    }

    fn render(&mut self) -> Result<Vec<u8>, DriverError> {
        self.check("render")?;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut image = Vec::with_capacity(w * h + 32);
        image.extend_from_slice(format!("P5 {w} {h} 255\n").as_bytes());

        // Cart on the bottom third, pole drawn as a bright diagonal.
        let cart_col = (((self.x + 2.4) / 4.8).clamp(0.0, 1.0) * (w as f64 - 1.0)) as usize;
        let horizon = h * 2 / 3;
        for row in 0..h {
            for col in 0..w {
                let near_cart = row >= horizon && col.abs_diff(cart_col) <= w / 16;
                let pole_col = cart_col as f64
                    + self.theta.sin() * (horizon.saturating_sub(row)) as f64;
                let near_pole =
                    row < horizon && (col as f64 - pole_col).abs() < 1.5;
                image.push(if near_cart {
                    220
                } else if near_pole {
                    255
                } else {
                    24
                });
            }
        }
        Ok(image)
    }

    fn dispose(&mut self) {
        self.loaded = false;
    }

    fn timestep(&self) -> Duration {
        Duration::from_secs_f64(TIMESTEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> CartpoleDriver {
        let mut d = CartpoleDriver::new();
        d.load("cartpole.xml", 64, 48, true).unwrap();
        d
    }

    #[test]
    fn test_load_rejects_empty_model() {
        let mut d = CartpoleDriver::new();
        assert!(matches!(
            d.load("", 64, 48, true),
            Err(DriverError::BadModel(_))
        ));
        assert!(matches!(
            d.load("m.xml", 0, 48, true),
            Err(DriverError::BadModel(_))
        ));
    }

    #[test]
    fn test_step_is_deterministic() {
        let mut a = loaded();
        let mut b = loaded();
        for _ in 0..50 {
            let sa = a.step(&[1.0]).unwrap();
            let sb = b.step(&[1.0]).unwrap();
            assert_eq!(sa, sb);
        }
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut d = loaded();
        let initial = d.reset().unwrap();
        d.step(&[5.0]).unwrap();
        d.step(&[5.0]).unwrap();
        let after_reset = d.reset().unwrap();
        assert_eq!(initial, after_reset);
        assert_eq!(after_reset.sim_time, 0.0);
    }

    #[test]
    fn test_step_advances_time_and_state() {
        let mut d = loaded();
        let s1 = d.step(&[2.0]).unwrap();
        let s2 = d.step(&[2.0]).unwrap();
        assert!(s2.sim_time > s1.sim_time);
        assert_ne!(s1.positions, s2.positions);
    }

    #[test]
    fn test_render_produces_nonempty_pgm() {
        let mut d = loaded();
        let frame = d.render().unwrap();
        assert!(frame.starts_with(b"P5 64 48 255\n"));
        assert!(frame.len() > 64 * 48);
    }

    #[test]
    fn test_injected_failures_consume() {
        let mut d = loaded();
        d.fail_next = 1;
        assert!(d.step(&[0.0]).is_err());
        assert!(d.step(&[0.0]).is_ok());
    }

    #[test]
    fn test_calls_before_load_fail() {
        let mut d = CartpoleDriver::new();
        assert!(d.step(&[0.0]).is_err());
        assert!(d.render().is_err());
    }
}
