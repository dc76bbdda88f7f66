//! Draft assembly: merge the converged outline with the chart figures.
//!
//! No agent calls. The result depends only on the inputs, so assembly can be
//! re-run from archived artifacts.

use crate::draft::{DraftArtifact, Figure, FigureArtifact};

/// New version of `outline` with `figures` attached in request order.
///
/// A figure whose title matches one already in the outline replaces it, so
/// re-assembling after a chart is regenerated does not duplicate it.
pub fn assemble(outline: &DraftArtifact, figures: &[Figure]) -> DraftArtifact {
    let mut draft = outline.next_version();
    for figure in figures {
        match draft
            .figures
            .iter_mut()
            .find(|f| f.title.eq_ignore_ascii_case(&figure.title))
        {
            Some(existing) => *existing = figure.clone(),
            None => draft.add_figure(figure.clone()),
        }
    }
    draft
}

/// Figures that carry an image rather than captured text.
pub fn image_count(draft: &DraftArtifact) -> usize {
    draft
        .figures
        .iter()
        .filter(|f| matches!(f.artifact, FigureArtifact::Image(_)))
        .count()
}
