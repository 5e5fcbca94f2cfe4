//! Runtime configuration for the harvesting engine.
//!
//! All policy knobs default to [`defaults`](crate::defaults) values and can
//! be overridden from environment variables; invalid values fall back with a
//! warning rather than failing startup.

use crate::defaults;

/// Policy knobs for partition planning and page-loop behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestConfig {
    /// Upstream single-query result cap; over-cap targets get partitioned.
    pub result_cap: i64,
    /// Earliest year enumerated by the by-year scheme.
    pub year_floor: i32,
    /// Consecutive empty years before the remaining tail is skipped.
    pub max_empty_years: u32,
    /// Consecutive zero-new pages before a partition is considered drained.
    pub max_stale_pages: u32,
    /// Retry budget per page fetch on transient upstream errors.
    pub page_max_retries: u32,
    /// Language codes enumerated by the by-language scheme.
    pub languages: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            result_cap: defaults::UPSTREAM_RESULT_CAP,
            year_floor: defaults::PARTITION_YEAR_FLOOR,
            max_empty_years: defaults::MAX_CONSECUTIVE_EMPTY_YEARS,
            max_stale_pages: defaults::MAX_CONSECUTIVE_STALE_PAGES,
            page_max_retries: defaults::PAGE_MAX_RETRIES,
            languages: ["en", "fr", "de", "es", "it", "ru"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment variables with fallback to
    /// defaults.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `HARVEST_RESULT_CAP` | `1000` | Upstream per-query result cap |
    /// | `HARVEST_YEAR_FLOOR` | `1990` | Earliest by-year partition |
    /// | `HARVEST_MAX_EMPTY_YEARS` | `3` | Empty-year early-stop count |
    /// | `HARVEST_MAX_STALE_PAGES` | `2` | Zero-new-page stop count |
    /// | `HARVEST_PAGE_RETRIES` | `3` | Per-page transient retry budget |
    /// | `HARVEST_LANGUAGES` | `en,fr,de,es,it,ru` | by-language keys |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HARVEST_RESULT_CAP") {
            match val.parse::<i64>() {
                Ok(cap) if cap > 0 => config.result_cap = cap,
                _ => tracing::warn!(value = %val, "Invalid HARVEST_RESULT_CAP, using default"),
            }
        }

        if let Ok(val) = std::env::var("HARVEST_YEAR_FLOOR") {
            match val.parse::<i32>() {
                Ok(floor) if floor > 1800 => config.year_floor = floor,
                _ => tracing::warn!(value = %val, "Invalid HARVEST_YEAR_FLOOR, using default"),
            }
        }

        if let Ok(val) = std::env::var("HARVEST_MAX_EMPTY_YEARS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_empty_years = n,
                _ => tracing::warn!(value = %val, "Invalid HARVEST_MAX_EMPTY_YEARS, using default"),
            }
        }

        if let Ok(val) = std::env::var("HARVEST_MAX_STALE_PAGES") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_stale_pages = n,
                _ => tracing::warn!(value = %val, "Invalid HARVEST_MAX_STALE_PAGES, using default"),
            }
        }

        if let Ok(val) = std::env::var("HARVEST_PAGE_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) => config.page_max_retries = n,
                _ => tracing::warn!(value = %val, "Invalid HARVEST_PAGE_RETRIES, using default"),
            }
        }

        if let Ok(val) = std::env::var("HARVEST_LANGUAGES") {
            let langs: Vec<String> = val
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if langs.is_empty() {
                tracing::warn!(value = %val, "Empty HARVEST_LANGUAGES, using default");
            } else {
                config.languages = langs;
            }
        }

        config
    }

    pub fn with_result_cap(mut self, cap: i64) -> Self {
        self.result_cap = cap;
        self
    }

    pub fn with_year_floor(mut self, floor: i32) -> Self {
        self.year_floor = floor;
        self
    }

    pub fn with_max_empty_years(mut self, n: u32) -> Self {
        self.max_empty_years = n;
        self
    }

    pub fn with_max_stale_pages(mut self, n: u32) -> Self {
        self.max_stale_pages = n;
        self
    }

    pub fn with_page_max_retries(mut self, n: u32) -> Self {
        self.page_max_retries = n;
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }
}

/// Selection thresholds for the gap detector.
#[derive(Debug, Clone, PartialEq)]
pub struct GapConfig {
    /// Absolute shortfall floor.
    pub absolute_floor: i64,
    /// Relative shortfall floor as a fraction of `declared_total`.
    pub relative_floor: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            absolute_floor: defaults::GAP_ABSOLUTE_FLOOR,
            relative_floor: defaults::GAP_RELATIVE_FLOOR,
        }
    }
}

impl GapConfig {
    /// Load configuration from `GAP_ABSOLUTE_FLOOR` / `GAP_RELATIVE_FLOOR`
    /// environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("GAP_ABSOLUTE_FLOOR") {
            match val.parse::<i64>() {
                Ok(n) if n >= 0 => config.absolute_floor = n,
                _ => tracing::warn!(value = %val, "Invalid GAP_ABSOLUTE_FLOOR, using default"),
            }
        }

        if let Ok(val) = std::env::var("GAP_RELATIVE_FLOOR") {
            match val.parse::<f64>() {
                Ok(f) if (0.0..=1.0).contains(&f) => config.relative_floor = f,
                _ => tracing::warn!(value = %val, "Invalid GAP_RELATIVE_FLOOR, using default"),
            }
        }

        config
    }

    pub fn with_absolute_floor(mut self, floor: i64) -> Self {
        self.absolute_floor = floor;
        self
    }

    pub fn with_relative_floor(mut self, floor: f64) -> Self {
        self.relative_floor = floor;
        self
    }

    /// Selection rule for auto-resume: the target's gap must clear **both**
    /// floors, and paused targets are never selected.
    pub fn needs_continuation(&self, target: &crate::models::HarvestTarget) -> bool {
        if target.harvest_paused || target.declared_total <= 0 {
            return false;
        }
        let gap = target.gap();
        gap > self.absolute_floor
            && (gap as f64) > self.relative_floor * (target.declared_total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HarvestTarget;
    use chrono::Utc;
    use uuid::Uuid;

    fn target(declared: i64, merged: i64, paused: bool) -> HarvestTarget {
        HarvestTarget {
            id: Uuid::new_v4(),
            source_key: "src".into(),
            query: "q".into(),
            declared_total: declared,
            merged_total: merged,
            scheme_override: None,
            harvest_paused: paused,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn harvest_config_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.result_cap, 1000);
        assert_eq!(config.year_floor, 1990);
        assert_eq!(config.max_empty_years, 3);
        assert_eq!(config.max_stale_pages, 2);
        assert_eq!(config.page_max_retries, 3);
        assert!(config.languages.contains(&"en".to_string()));
    }

    #[test]
    fn harvest_config_builders() {
        let config = HarvestConfig::default()
            .with_result_cap(500)
            .with_year_floor(2000)
            .with_max_empty_years(5)
            .with_max_stale_pages(1)
            .with_page_max_retries(0)
            .with_languages(vec!["la".into()]);

        assert_eq!(config.result_cap, 500);
        assert_eq!(config.year_floor, 2000);
        assert_eq!(config.max_empty_years, 5);
        assert_eq!(config.max_stale_pages, 1);
        assert_eq!(config.page_max_retries, 0);
        assert_eq!(config.languages, vec!["la".to_string()]);
    }

    #[test]
    fn harvest_config_from_env_parses_and_rejects() {
        std::env::set_var("HARVEST_RESULT_CAP", "750");
        std::env::set_var("HARVEST_YEAR_FLOOR", "not-a-year");
        std::env::set_var("HARVEST_LANGUAGES", "EN, fr ,,de");

        let config = HarvestConfig::from_env();
        assert_eq!(config.result_cap, 750);
        // invalid value falls back
        assert_eq!(config.year_floor, defaults::PARTITION_YEAR_FLOOR);
        assert_eq!(
            config.languages,
            vec!["en".to_string(), "fr".to_string(), "de".to_string()]
        );

        std::env::remove_var("HARVEST_RESULT_CAP");
        std::env::remove_var("HARVEST_YEAR_FLOOR");
        std::env::remove_var("HARVEST_LANGUAGES");
    }

    #[test]
    fn gap_config_defaults() {
        let config = GapConfig::default();
        assert_eq!(config.absolute_floor, 100);
        assert!((config.relative_floor - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn gap_selection_requires_both_floors() {
        let config = GapConfig::default();

        // 5% short and under the absolute floor: not selected.
        assert!(!config.needs_continuation(&target(1000, 950, false)));
        // 150 short, 15%: selected.
        assert!(config.needs_continuation(&target(1000, 850, false)));
        // Large absolute gap but tiny relative gap: not selected.
        assert!(!config.needs_continuation(&target(100_000, 99_800, false)));
        // Large relative gap but tiny absolute gap: not selected.
        assert!(!config.needs_continuation(&target(120, 10, false)));
    }

    #[test]
    fn gap_selection_excludes_paused_and_empty() {
        let config = GapConfig::default();
        assert!(!config.needs_continuation(&target(1000, 0, true)));
        assert!(!config.needs_continuation(&target(0, 0, false)));
    }
}
