//! Finite-difference check of the analytic backward pass.

use crate::dataset::Label;
use crate::error::Result;
use crate::image::Image;
use crate::network::{Network, NetworkParameters, binary_cross_entropy};
use std::fmt;
use tracing::debug;

/// A scalar parameter whose gradient is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// `dense2_weights[0]`
    OutputWeight,
    /// `dense1_weights[0, 0]`
    HiddenWeight,
    /// `kernels1[0, 0, 0]`
    FirstKernelWeight,
}

impl Probe {
    pub const ALL: [Probe; 3] = [
        Probe::OutputWeight,
        Probe::HiddenWeight,
        Probe::FirstKernelWeight,
    ];

    fn slot(self, params: &mut NetworkParameters) -> &mut f64 {
        match self {
            Probe::OutputWeight => &mut params.dense2_weights[0],
            Probe::HiddenWeight => &mut params.dense1_weights[[0, 0]],
            Probe::FirstKernelWeight => &mut params.kernels1[[0, 0, 0]],
        }
    }

    fn read(self, params: &NetworkParameters) -> f64 {
        match self {
            Probe::OutputWeight => params.dense2_weights[0],
            Probe::HiddenWeight => params.dense1_weights[[0, 0]],
            Probe::FirstKernelWeight => params.kernels1[[0, 0, 0]],
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Probe::OutputWeight => "dense2_weights[0]",
            Probe::HiddenWeight => "dense1_weights[0,0]",
            Probe::FirstKernelWeight => "kernels1[0]",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub probe: Probe,
    pub analytic: f64,
    pub numeric: f64,
    /// `|a - n| / max(1e-8, |a| + |n|)`
    pub relative_error: f64,
}

impl ProbeResult {
    fn new(probe: Probe, analytic: f64, numeric: f64) -> ProbeResult {
        let scale = (analytic.abs() + numeric.abs()).max(1e-8);
        let relative_error = (analytic - numeric).abs() / scale;
        ProbeResult {
            probe,
            analytic,
            numeric,
            relative_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckReport {
    pub epsilon: f64,
    pub probes: Vec<ProbeResult>,
}

impl GradCheckReport {
    pub fn max_relative_error(&self) -> f64 {
        self.probes.iter().map(|result| result.relative_error).fold(0.0, f64::max)
    }
}

impl fmt::Display for GradCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gradcheck results (eps={}):", self.epsilon)?;
        for result in &self.probes {
            writeln!(
                f,
                " {}: analytic={:.8e} numeric={:.8e} rel_err={:.8e}",
                result.probe, result.analytic, result.numeric, result.relative_error
            )?;
        }
        Ok(())
    }
}

impl Network {
    /// Compares the backward pass against central differences for each
    /// [`Probe`].
    ///
    /// Both sides use the regularized objective, cross-entropy plus
    /// `l2 / 2 * sum(w^2)`, whose gradient is what training descends. Every
    /// probed parameter is restored to its exact prior value.
    pub fn grad_check(
        &mut self,
        image: &Image,
        label: Label,
        epsilon: f64,
    ) -> Result<GradCheckReport> {
        let trace = self.trace(image)?;
        let gradients = self.gradients(image, &trace, label);
        let l2 = self.tunables().l2;

        let mut probes = Vec::with_capacity(Probe::ALL.len());
        for probe in Probe::ALL {
            let original = probe.read(self.parameters());
            let analytic = probe.read(&gradients) + l2 * original;

            *probe.slot(self.parameters_mut()) = original + epsilon;
            let plus = self.regularized_loss(image, label);
            *probe.slot(self.parameters_mut()) = original - epsilon;
            let minus = self.regularized_loss(image, label);
            *probe.slot(self.parameters_mut()) = original;

            let numeric = (plus? - minus?) / (2.0 * epsilon);
            let result = ProbeResult::new(probe, analytic, numeric);
            debug!(
                %probe,
                analytic,
                numeric,
                relative_error = result.relative_error,
                "gradient probe"
            );
            probes.push(result);
        }

        Ok(GradCheckReport { epsilon, probes })
    }

    fn regularized_loss(&self, image: &Image, label: Label) -> Result<f64> {
        let probability = self.forward(image)?;
        let penalty = 0.5 * self.tunables().l2 * self.parameters().sum_of_squares();
        Ok(binary_cross_entropy(probability, label) + penalty)
    }
}
