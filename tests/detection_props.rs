use csv_datespan::{
    formats::{AmbiguityPreference, FormatCatalog},
    heuristic::{DetectionOptions, DetectionSample, detect},
};
use proptest::prelude::*;

fn cell() -> impl Strategy<Value = String> {
    prop_oneof![
        (1990i32..2030, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| format!("{y}-{m:02}-{d:02}")),
        (1u32..=12, 1u32..=28, 1990i32..2030).prop_map(|(m, d, y)| format!("{m:02}/{d:02}/{y}")),
        "[a-z]{1,8}",
        "[0-9]{1,6}",
        Just(String::new()),
    ]
}

fn table() -> impl Strategy<Value = (usize, Vec<Vec<String>>)> {
    (1usize..5).prop_flat_map(|width| {
        (
            Just(width),
            prop::collection::vec(prop::collection::vec(cell(), width), 0..60),
        )
    })
}

proptest! {
    #[test]
    fn ratios_stay_in_bounds_and_selection_matches_threshold(
        (width, rows) in table(),
        threshold in 0.0f64..=1.0,
    ) {
        let headers = (0..width).map(|i| format!("c{i}")).collect::<Vec<_>>();
        let sample = DetectionSample::from_rows(headers.clone(), rows, 1000);
        let options = DetectionOptions { threshold, ..DetectionOptions::default() };
        let result = detect(&sample, &headers, &options);

        prop_assert_eq!(result.candidates.len(), width);
        for candidate in &result.candidates {
            let ratio = candidate.ratio();
            prop_assert!((0.0..=1.0).contains(&ratio));
            prop_assert!(candidate.successes <= candidate.attempts);
        }
        let any_qualifies = result.candidates.iter().any(|c| c.qualifies(threshold));
        prop_assert_eq!(result.selected.is_some(), any_qualifies);
        if let Some(selected) = &result.selected {
            prop_assert!(selected.ratio() >= threshold);
            let best = result
                .qualifying()
                .map(|c| c.ratio())
                .fold(0.0f64, f64::max);
            prop_assert_eq!(selected.ratio(), best);
        }
    }

    #[test]
    fn parsed_dates_render_back_to_iso(y in 1900i32..2100, m in 1u32..=12, d in 1u32..=28) {
        let catalog = FormatCatalog::new(AmbiguityPreference::DayFirst);
        let value = format!("{d:02}/{m:02}/{y}");
        let (spec, date) = catalog.parse_any(&value).expect("slash date parses");
        prop_assert_eq!(spec.id, "eu-slash");
        prop_assert_eq!(date.format("%d/%m/%Y").to_string(), value);
    }
}
