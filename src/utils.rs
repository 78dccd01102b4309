/// Value of a time series at `time`, holding the last value past its end.
/// Empty series read as zero.
///
/// ## Example
///
/// ```
/// let prices = vec![30.0, 45.0];
///
/// assert_eq!(dro_dispatch::utils::hold_last(&prices, 1), 45.0);
/// assert_eq!(dro_dispatch::utils::hold_last(&prices, 7), 45.0);
/// assert_eq!(dro_dispatch::utils::hold_last(&[], 0), 0.0);
/// ```
pub fn hold_last(series: &[f64], time: usize) -> f64 {
    series
        .get(time)
        .or_else(|| series.last())
        .copied()
        .unwrap_or(0.0)
}
