//! Template selection for scale-out.
//!
//! Each template is scored against the outstanding demand:
//! - **Distance**: how far its RAM-per-core ratio is from the demand's ratio
//! - **Remainder**: `(cores_left) + (ram_left)` after subtracting the
//!   template, signed, so a template that overshoots scores lower than
//!   one that leaves demand unmet
//!
//! Every template at the minimum distance is considered, and the lowest
//! remainder among them wins. Remaining ties go to the lower name.

use std::cmp::Ordering;

use vmscale_core::{ResourceDemand, VmTemplate};

/// Ratios closer than this count as equal.
const RATIO_EPSILON: f64 = 1e-9;

/// A template scored against a demand.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateFit<'a> {
    pub template: &'a VmTemplate,
    /// `|ram/cores (template) - ram/cores (demand)|`
    pub distance: f64,
    /// Signed demand left after this template.
    pub remainder: f64,
}

/// Score one template. `demand.cores` must be positive.
pub fn score_template<'a>(template: &'a VmTemplate, demand: ResourceDemand) -> TemplateFit<'a> {
    let target = demand.ram / demand.cores;
    let left = demand.minus(template.cores, template.ram);
    TemplateFit {
        template,
        distance: (template.ram_per_core() - target).abs(),
        remainder: left.cores + left.ram,
    }
}

/// Pick the best-fitting template, or `None` when there are none.
pub fn best_fit<'a>(
    templates: impl IntoIterator<Item = &'a VmTemplate>,
    demand: ResourceDemand,
) -> Option<TemplateFit<'a>> {
    let fits: Vec<TemplateFit<'a>> = templates
        .into_iter()
        .map(|t| score_template(t, demand))
        .collect();

    let closest = fits
        .iter()
        .map(|f| f.distance)
        .min_by(|a, b| a.total_cmp(b))?;

    fits.into_iter()
        .filter(|f| f.distance - closest <= RATIO_EPSILON)
        .min_by(|a, b| {
            match a.remainder.total_cmp(&b.remainder) {
                Ordering::Equal => a.template.name.cmp(&b.template.name),
                other => other,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, cores: u32, ram: u32) -> VmTemplate {
        VmTemplate {
            name: name.to_string(),
            cores,
            ram,
            max_age_seconds: 3600,
            profile: format!("profile-{name}"),
        }
    }

    #[test]
    fn empty_catalog_has_no_fit() {
        let templates: Vec<VmTemplate> = Vec::new();
        assert!(best_fit(&templates, ResourceDemand::new(2.0, 4.0)).is_none());
    }

    #[test]
    fn tied_ratio_prefers_overshoot() {
        let templates = [template("small", 2, 4), template("large", 8, 16)];
        let fit = best_fit(&templates, ResourceDemand::new(6.0, 12.0)).unwrap();

        assert_eq!(fit.template.name, "large");
        assert_eq!(fit.distance, 0.0);
        assert_eq!(fit.remainder, -6.0);
    }

    #[test]
    fn closest_ratio_beats_smaller_remainder() {
        // Demand is memory-heavy (4 GiB per core).
        let templates = [template("cpu", 16, 16), template("mem", 2, 8)];
        let fit = best_fit(&templates, ResourceDemand::new(4.0, 16.0)).unwrap();
        assert_eq!(fit.template.name, "mem");
    }

    #[test]
    fn remainder_tie_broken_by_name() {
        let templates = [template("b", 2, 4), template("a", 2, 4)];
        let fit = best_fit(&templates, ResourceDemand::new(2.0, 4.0)).unwrap();
        assert_eq!(fit.template.name, "a");
    }

    #[test]
    fn fractional_demand_ratio() {
        let templates = [template("r2", 4, 8), template("r4", 4, 16), template("r1", 4, 4)];
        // ratio 3.2 is closest to 4 (0.8) vs 2 (1.2).
        let fit = best_fit(&templates, ResourceDemand::new(2.5, 8.0)).unwrap();
        assert_eq!(fit.template.name, "r4");
    }

    #[test]
    fn score_template_components() {
        let t = template("small", 2, 4);
        let fit = score_template(&t, ResourceDemand::new(6.0, 12.0));
        assert_eq!(fit.distance, 0.0);
        assert_eq!(fit.remainder, 12.0);
    }
}
