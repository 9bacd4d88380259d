//! Report configuration files (YAML or JSON).

use std::fs;
use std::path::Path;

use crate::spec::{ConfigError, SpecReportConfig};

/// Load a [`SpecReportConfig`], choosing the parser by file extension.
pub fn load_report_config(path: &Path) -> Result<SpecReportConfig, ConfigError> {
    let c_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let text = match c_ext.as_str() {
        "yaml" | "yml" | "json" => fs::read_to_string(path)?,
        _ => return Err(ConfigError::UnknownExtension(path.to_path_buf())),
    };
    let config = if c_ext == "json" {
        parse_report_config_json(&text)?
    } else {
        parse_report_config_yaml(&text)?
    };
    tracing::debug!(
        path = %path.display(),
        n_pivots = config.pivots.len(),
        "report config loaded"
    );
    Ok(config)
}

pub fn parse_report_config_yaml(text: &str) -> Result<SpecReportConfig, ConfigError> {
    Ok(serde_yaml::from_str(text)?)
}

pub fn parse_report_config_json(text: &str) -> Result<SpecReportConfig, ConfigError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{
        EnumBackoff, EnumColumnWidth, EnumColumnWidthPreset, EnumConditionalFormatting,
        EnumConsolidationFunction, EnumPivotCalculation, EnumValueCalculation,
    };

    const C_YAML: &str = r#"
file_name: weekly
file_path: out
retry:
  attempts_max: 2
  backoff: exponential
pivots:
  - sheet: by region
    filters:
      - key: year
        selected: ["2024"]
    rows: [region, city]
    cols:
      - key: quarter
        selected: [Q2, Q1]
    values:
      - key: sales
        calculated: percent_of_total
        conditional_formatting: bars
        analysis:
          line_num: -1
          average_deviation: [-0.1, 0.1]
      - key: margin
        calculated: "= profit / sales"
        displayed_name: Margin
      - key: orders
        calculated: count
    col_width: [20, price]
    collide: false
"#;

    #[test]
    fn test_yaml_config_parses_descriptors() {
        let config = parse_report_config_yaml(C_YAML).expect("yaml");
        assert_eq!(config.file_name, "weekly");
        assert_eq!(config.file_ext, "xlsx");
        assert_eq!(config.retry.attempts_max, 2);
        assert_eq!(config.retry.backoff, EnumBackoff::Exponential);

        let pivot = &config.pivots[0];
        assert_eq!(pivot.first_data_row(), 4);
        assert_eq!(pivot.rows[1].key, "city");
        assert!(!pivot.collide);
        assert!(pivot.freeze_panes);
        assert_eq!(
            pivot.values[0].calculated,
            Some(EnumValueCalculation::Calculation(EnumPivotCalculation::PercentOfTotal))
        );
        assert_eq!(
            pivot.values[0].conditional_formatting,
            EnumConditionalFormatting::Bars
        );
        assert_eq!(pivot.values[1].formula(), Some("= profit / sales"));
        assert_eq!(
            pivot.values[2].calculated,
            Some(EnumValueCalculation::Aggregation(EnumConsolidationFunction::Count))
        );
        assert_eq!(
            pivot.col_width,
            vec![
                EnumColumnWidth::Width(20.0),
                EnumColumnWidth::Preset(EnumColumnWidthPreset::Price)
            ]
        );
    }

    #[test]
    fn test_load_dispatches_on_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path_json = dir.path().join("report.json");
        fs::write(
            &path_json,
            r#"{"file_name": "daily", "pivots": [{"sheet": "p", "rows": ["region"]}]}"#,
        )
        .expect("write");
        let config = load_report_config(&path_json).expect("json");
        assert_eq!(config.file_name, "daily");
        assert_eq!(config.pivots[0].sheet, "p");

        let path_yml = dir.path().join("report.YML");
        fs::write(&path_yml, C_YAML).expect("write");
        assert_eq!(
            load_report_config(&path_yml).expect("yml").file_name,
            "weekly"
        );

        let path_toml = dir.path().join("report.toml");
        fs::write(&path_toml, "").expect("write");
        assert!(matches!(
            load_report_config(&path_toml),
            Err(ConfigError::UnknownExtension(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_reports_error() {
        assert!(matches!(
            parse_report_config_yaml("pivots: {"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_unknown_calculation_is_rejected() {
        let c_yaml = r#"
pivots:
  - sheet: p
    values:
      - key: sales
        calculated: profit / sales
"#;
        let err = parse_report_config_yaml(c_yaml).expect_err("rejected");
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert!(err.to_string().contains("profit / sales"), "{err}");
    }
}
