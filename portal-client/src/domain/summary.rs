/// The portal reports billing-cycle quantities in hundred cubic feet.
pub const HCF_TO_GALLONS: f64 = 748.0;

pub fn hcf_to_gallons(hcf: f64) -> f64 {
    hcf * HCF_TO_GALLONS
}

/// Billing-cycle summary values, as reported (HCF).
///
/// Every field is optional: the portal omits tables freely, and consumers
/// surface whatever subset is present.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleSummary {
    pub so_far_hcf: Option<f64>,
    pub projected_hcf: Option<f64>,
    pub average_hcf: Option<f64>,
    pub highest_hcf: Option<f64>,
    pub last_cycle_hcf: Option<f64>,
    pub cycle_date: Option<String>,
}

impl CycleSummary {
    pub fn so_far_gallons(&self) -> Option<f64> {
        self.so_far_hcf.map(hcf_to_gallons)
    }

    pub fn projected_gallons(&self) -> Option<f64> {
        self.projected_hcf.map(hcf_to_gallons)
    }

    pub fn average_gallons(&self) -> Option<f64> {
        self.average_hcf.map(hcf_to_gallons)
    }

    pub fn highest_gallons(&self) -> Option<f64> {
        self.highest_hcf.map(hcf_to_gallons)
    }

    pub fn last_cycle_gallons(&self) -> Option<f64> {
        self.last_cycle_hcf.map(hcf_to_gallons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_hcf_to_gallons() {
        let summary = CycleSummary {
            so_far_hcf: Some(2.0),
            ..CycleSummary::default()
        };
        assert_eq!(summary.so_far_gallons(), Some(1496.0));
        assert_eq!(summary.projected_gallons(), None);
    }
}
