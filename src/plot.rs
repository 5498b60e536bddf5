//! Learning curves of a training run

use std::{error::Error, path::Path};

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    prelude::{BitMapBackend, IntoDrawingArea, PathElement},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, WHITE},
};

use crate::{metrics::Metrics, train::EpochSummary};

/// Writes `loss.png` and `accuracy.png` with train and eval curves per epoch
pub fn plot_history(history: &[EpochSummary], output_dir: &Path) -> Result<(), Box<dyn Error>> {
    if history.is_empty() {
        log::warn!("Nothing to plot, the history is empty");
        return Ok(());
    }
    std::fs::create_dir_all(output_dir)?;

    let max_loss = history
        .iter()
        .flat_map(|h| [h.train.loss, h.eval.loss])
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max);
    plot_curves(
        history,
        &output_dir.join("loss.png"),
        "Loss",
        0.0..(max_loss * 1.1).max(1e-3),
        |m| m.loss,
    )?;
    plot_curves(
        history,
        &output_dir.join("accuracy.png"),
        "Accuracy (%)",
        0.0..100.0,
        |m| m.accuracy * 100.0,
    )?;
    Ok(())
}

fn plot_curves(
    history: &[EpochSummary],
    file_name: &Path,
    caption: &str,
    y_range: std::ops::Range<f32>,
    value: impl Fn(&Metrics) -> f32,
) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let last_epoch = history.last().map_or(1, |h| h.epoch).max(2) as f32;
    let mut chart = ChartBuilder::on(&root_area)
        .caption(caption, ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(1.0f32..last_epoch, y_range)?;

    chart.configure_mesh().x_desc("epoch").draw()?;

    chart
        .draw_series(LineSeries::new(
            history.iter().map(|h| (h.epoch as f32, value(&h.train))),
            RED.stroke_width(2),
        ))?
        .label("train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
    chart
        .draw_series(LineSeries::new(
            history.iter().map(|h| (h.epoch as f32, value(&h.eval))),
            BLUE.stroke_width(2),
        ))?
        .label("eval")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Plot has been saved to '{}'.", file_name.display());

    Ok(())
}
