use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    segmenter::{Candidate, SegmentationResult},
};

/// Picks the conjunctiva mask out of the segmentation candidates.
///
/// Candidates of `target_class` are preferred; when there are none the whole
/// set is considered instead. Among the considered masks the one with the
/// largest pixel-sum area wins, ties going to the earliest candidate.
pub fn select_mask(result: &SegmentationResult, target_class: i32) -> Result<&Candidate> {
    if result.is_empty() {
        return Err(Error::NoRegionDetected);
    }

    let mut pool: Vec<&Candidate> = result
        .candidates
        .iter()
        .filter(|candidate| candidate.class_id == target_class)
        .collect();
    if pool.is_empty() {
        warn!(
            target_class,
            candidates = result.len(),
            "no candidate of the target class, falling back to all candidates"
        );
        pool = result.candidates.iter().collect();
    }

    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in pool {
        let area = candidate.area()?;
        match best {
            // strict comparison keeps the first of equal areas
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((candidate, area)),
        }
    }

    let (chosen, area) = best.ok_or(Error::NoRegionDetected)?;
    debug!(
        class_id = chosen.class_id,
        score = chosen.score,
        area,
        "selected mask"
    );

    Ok(chosen)
}
