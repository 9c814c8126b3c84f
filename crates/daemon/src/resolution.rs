//! Adaptive resolution planning
//!
//! Decides whether a video should be downscaled to fit its bitrate budget.
//! Quality is approximated by *density*: video kbps per megapixel of frame
//! area. Encoding a large frame at starvation density wastes bits, but
//! moderately constrained budgets should not trigger aggressive drops, so the
//! choice is limited by a per-density drop budget and soft floors at 1080p and
//! 720p.

use serde::{Deserialize, Serialize};

/// Canonical output heights, highest first
pub const LADDER: [u32; 7] = [2160, 1440, 1080, 720, 480, 360, 240];

/// Density (kbps per megapixel) at which the original resolution is kept
pub const PLENTY: f64 = 850.0;
/// Density considered acceptable for a rung
pub const MIN_OK: f64 = 550.0;
/// Density accepted when no rung reaches [`MIN_OK`]
pub const MIN_FALLBACK: f64 = 350.0;
/// Below this density even the 720p soft floor gives way
pub const EXTREME_FLOOR: f64 = 220.0;

pub const DEFAULT_MIN_HEIGHT: u32 = 240;

/// Scaling bounds for the encoder. `None` means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl ResolutionDecision {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn height(height: u32) -> Self {
        Self {
            max_width: None,
            max_height: Some(height),
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.max_width.is_none() && self.max_height.is_none()
    }
}

/// Inputs to [`plan`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanRequest {
    pub orig_width: Option<u32>,
    pub orig_height: Option<u32>,
    /// Source video bitrate. Informational; the decision is driven by the target.
    pub orig_video_kbps: Option<f64>,
    pub target_video_kbps: f64,
    pub min_height: u32,
    pub explicit_target_height: Option<u32>,
}

impl PlanRequest {
    pub fn new(orig_width: Option<u32>, orig_height: Option<u32>, target_video_kbps: f64) -> Self {
        Self {
            orig_width,
            orig_height,
            orig_video_kbps: None,
            target_video_kbps,
            min_height: DEFAULT_MIN_HEIGHT,
            explicit_target_height: None,
        }
    }

    pub fn with_orig_video_kbps(mut self, kbps: Option<f64>) -> Self {
        self.orig_video_kbps = kbps;
        self
    }

    pub fn with_min_height(mut self, min_height: u32) -> Self {
        self.min_height = min_height;
        self
    }

    pub fn with_explicit_height(mut self, height: Option<u32>) -> Self {
        self.explicit_target_height = height;
        self
    }
}

/// Aspect-preserving frame geometry of the source
#[derive(Debug, Clone, Copy)]
struct Source {
    width: f64,
    height: u32,
}

impl Source {
    /// Megapixels of the frame scaled to height `h`
    fn megapixels(&self, h: u32) -> f64 {
        let h = h as f64;
        self.width * (h / self.height as f64) * h / 1_000_000.0
    }

    fn density(&self, target_kbps: f64, h: u32) -> f64 {
        let mp = self.megapixels(h);
        if mp <= 0.0 {
            return 0.0;
        }
        target_kbps / mp
    }
}

/// How many ladder rungs below the source the choice may fall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropBudget {
    Rungs(usize),
    Unlimited,
}

impl DropBudget {
    fn for_density(density: f64) -> Self {
        if density >= MIN_OK {
            DropBudget::Rungs(1)
        } else if density >= MIN_FALLBACK {
            DropBudget::Rungs(2)
        } else {
            DropBudget::Unlimited
        }
    }
}

/// Index of the highest rung not above `h` (the last rung for tiny heights)
fn rung_index(h: u32) -> usize {
    LADDER
        .iter()
        .position(|&rung| rung <= h)
        .unwrap_or(LADDER.len() - 1)
}

/// Choose scaling bounds for a job. Never fails.
///
/// The returned height is never above the source height and never below the
/// effective floor (`min_height`, capped at the source height so the floor
/// cannot force an upscale). An explicit target height bypasses the heuristic.
pub fn plan(req: &PlanRequest) -> ResolutionDecision {
    let (width, height) = match (req.orig_width, req.orig_height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return ResolutionDecision::unconstrained(),
    };

    if let Some(explicit) = req.explicit_target_height.filter(|h| *h > 0) {
        return ResolutionDecision::height(explicit.max(req.min_height));
    }

    let floor = req.min_height.min(height);

    if !(req.target_video_kbps > 0.0) {
        return ResolutionDecision::height(floor);
    }

    let source = Source {
        width: width as f64,
        height,
    };
    let target = req.target_video_kbps;
    let orig_density = source.density(target, height);

    if orig_density >= PLENTY {
        return ResolutionDecision::height(height.max(floor));
    }

    let budget = DropBudget::for_density(orig_density);

    let candidates: Vec<u32> = LADDER.iter().copied().filter(|&h| h <= height).collect();
    let first_meeting = |threshold: f64| {
        candidates
            .iter()
            .copied()
            .find(|&h| source.density(target, h) >= threshold)
    };
    let candidate = first_meeting(MIN_OK)
        .or_else(|| first_meeting(MIN_FALLBACK))
        .unwrap_or(floor);

    let mut chosen = clamp_to_budget(candidate, height, budget);

    if height >= 1440 && chosen < 1080 && source.density(target, 1080) >= MIN_FALLBACK {
        chosen = 1080;
    }
    if height >= 720 && chosen < 720 && source.density(target, 720) >= EXTREME_FLOOR {
        chosen = 720;
    }

    ResolutionDecision::height(chosen.max(floor).min(height))
}

/// Raise `candidate` to the lowest rung the drop budget allows
fn clamp_to_budget(candidate: u32, source_height: u32, budget: DropBudget) -> u32 {
    let DropBudget::Rungs(rungs) = budget else {
        return candidate;
    };

    let source_rung = rung_index(source_height);
    // an off-ladder source already sits above its nearest rung, so stepping
    // down to that rung spends one unit of the budget
    let on_ladder = LADDER[source_rung] == source_height;
    let spent_by_rounding = usize::from(!on_ladder);
    let lowest_allowed = (source_rung + rungs - spent_by_rounding).min(LADDER.len() - 1);

    if rung_index(candidate) > lowest_allowed {
        LADDER[lowest_allowed]
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn planned_height(req: PlanRequest) -> Option<u32> {
        let decision = plan(&req);
        assert!(decision.max_width.is_none(), "width is never constrained");
        decision.max_height
    }

    #[test]
    fn test_missing_dimensions_are_unconstrained() {
        assert!(plan(&PlanRequest::new(None, Some(1080), 4000.0)).is_unconstrained());
        assert!(plan(&PlanRequest::new(Some(1920), None, 4000.0)).is_unconstrained());
        assert!(plan(&PlanRequest::new(Some(0), Some(1080), 4000.0)).is_unconstrained());
    }

    #[test]
    fn test_explicit_target_overrides() {
        let req = PlanRequest::new(Some(3840), Some(2160), 2000.0)
            .with_orig_video_kbps(Some(8000.0))
            .with_explicit_height(Some(720));
        assert_eq!(plan(&req), ResolutionDecision::height(720));
    }

    #[test]
    fn test_explicit_target_respects_min_height() {
        let req = PlanRequest::new(Some(1920), Some(1080), 2000.0)
            .with_min_height(480)
            .with_explicit_height(Some(360));
        assert_eq!(planned_height(req), Some(480));
    }

    #[test]
    fn test_keep_original_when_high_bitrate() {
        let req = PlanRequest::new(Some(1920), Some(1080), 8000.0).with_orig_video_kbps(Some(15000.0));
        let height = planned_height(req);
        assert!(matches!(height, None | Some(1080)), "got {:?}", height);
    }

    #[test]
    fn test_downscale_4k_low_bitrate() {
        let req = PlanRequest::new(Some(3840), Some(2160), 2500.0).with_orig_video_kbps(Some(12000.0));
        let height = planned_height(req).expect("4K at 2.5 Mbps must be constrained");
        assert!([1440, 1080, 720, 480, 360, 240].contains(&height));
        // 1440p holds ~680 kbps/MPix, so a single rung drop is enough
        assert_eq!(height, 1440);
    }

    #[test]
    fn test_min_height_respected() {
        let req = PlanRequest::new(Some(640), Some(360), 200.0)
            .with_orig_video_kbps(Some(800.0))
            .with_min_height(360);
        assert_eq!(plan(&req), ResolutionDecision::height(360));
    }

    #[test]
    fn test_zero_target_returns_floor() {
        let req = PlanRequest::new(Some(1920), Some(1080), 0.0);
        assert_eq!(planned_height(req), Some(240));
    }

    #[test]
    fn test_drop_budget_limits_moderate_budgets() {
        // 1080p at 1200 kbps: ~579 kbps/MPix at source, so at most one rung down
        let req = PlanRequest::new(Some(1920), Some(1080), 1200.0);
        assert_eq!(planned_height(req), Some(1080));
    }

    #[test]
    fn test_starved_1080p_keeps_720_floor() {
        // 1080p at 300 kbps: 720p sits at ~325 kbps/MPix, above the extreme floor
        let req = PlanRequest::new(Some(1920), Some(1080), 300.0);
        assert_eq!(planned_height(req), Some(720));
    }

    #[test]
    fn test_extreme_starvation_drops_below_720() {
        // 720p density ~100 kbps/MPix: below EXTREME_FLOOR, so the floor yields
        let req = PlanRequest::new(Some(1920), Some(1080), 92.0);
        let height = planned_height(req).unwrap();
        assert!(height < 720, "got {}", height);
    }

    #[test]
    fn test_1440_soft_floor_for_4k() {
        // 4K at 900 kbps: 1080p density ~434 >= MIN_FALLBACK, keep 1080p
        let req = PlanRequest::new(Some(3840), Some(2160), 900.0);
        assert_eq!(planned_height(req), Some(1080));
    }

    #[test]
    fn test_off_ladder_source_counts_rounding_as_a_drop() {
        // 1920x800 at 800 kbps: ~521 kbps/MPix at source (two rung budget)
        let req = PlanRequest::new(Some(1920), Some(800), 800.0);
        let height = planned_height(req).unwrap();
        assert!(height == 720 || height == 800, "got {}", height);
    }

    #[test]
    fn test_clamp_spends_budget_on_rounding_to_ladder() {
        // On-ladder 1080: two rungs reach 480
        assert_eq!(clamp_to_budget(240, 1080, DropBudget::Rungs(2)), 480);
        // 1300 rounds down to 1080 first, so two rungs stop at 720
        assert_eq!(clamp_to_budget(240, 1300, DropBudget::Rungs(2)), 720);
        assert_eq!(clamp_to_budget(240, 800, DropBudget::Rungs(1)), 720);
        assert_eq!(clamp_to_budget(360, 800, DropBudget::Unlimited), 360);
        // Candidates inside the budget pass through
        assert_eq!(clamp_to_budget(720, 1300, DropBudget::Rungs(2)), 720);
    }

    #[test]
    fn test_source_below_floor_is_not_upscaled() {
        let req = PlanRequest::new(Some(320), Some(180), 100.0);
        assert_eq!(planned_height(req), Some(180));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_height_within_bounds(
            width in 160u32..7680,
            height in 240u32..4320,
            target in -100.0f64..60000.0,
            min_idx in 0usize..LADDER.len(),
        ) {
            let min_height = LADDER[min_idx].min(height);
            let req = PlanRequest::new(Some(width), Some(height), target).with_min_height(min_height);
            let decision = plan(&req);

            prop_assert!(decision.max_width.is_none());
            if let Some(h) = decision.max_height {
                prop_assert!(h >= min_height, "{} below floor {}", h, min_height);
                prop_assert!(h <= height, "{} above source {}", h, height);
            }
        }

        #[test]
        fn prop_explicit_height_always_wins(
            width in 1u32..7680,
            height in 1u32..4320,
            target in 0.0f64..60000.0,
            explicit in 240u32..2160,
        ) {
            let req = PlanRequest::new(Some(width), Some(height), target)
                .with_min_height(240)
                .with_explicit_height(Some(explicit));
            prop_assert_eq!(plan(&req), ResolutionDecision::height(explicit));
        }

        #[test]
        fn prop_more_bitrate_never_lowers_resolution(
            height_idx in 0usize..4,
            target in 100.0f64..20000.0,
            extra in 0.0f64..20000.0,
        ) {
            let height = LADDER[height_idx];
            let width = height * 16 / 9;
            let low = plan(&PlanRequest::new(Some(width), Some(height), target)).max_height;
            let high = plan(&PlanRequest::new(Some(width), Some(height), target + extra)).max_height;
            prop_assert!(high >= low, "{:?} < {:?}", high, low);
        }
    }
}
