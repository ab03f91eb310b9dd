#[cfg(test)]
mod tests {
    use super::super::*;
    use std::time::Duration;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        [filings]
        identity = "Example Research research@example.com"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.registry.study_type, "INTERVENTIONAL");
        assert_eq!(config.publications.sources.len(), 4);
        assert_eq!(config.publications.top_k, 3);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.pipeline.run.max_concurrent_trials, 4);
        assert_eq!(config.pipeline.acceptance, AcceptancePolicy::FirstMatch);
        assert_eq!(config.extractor.max_window_chars, 2000);
        assert_eq!(config.output.sqlite_url, "sqlite://trialink.db");
        assert!(config.output.json_dir.is_none());
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        let err = Config::from_toml("[registry]\nstudy_type = \"INTERVENTIONAL\"").unwrap_err();
        assert!(err.to_string().contains("filings.identity"));
    }

    #[test]
    fn test_compatible_provider_needs_base_url() {
        let toml = format!("{MINIMAL}\n[llm]\nprovider = \"openai_compatible\"\nmodel = \"m\"\n");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_zero_llm_timeout_is_rejected() {
        let toml = format!("{MINIMAL}\n[llm]\ntimeout_secs = 0\n");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("llm.timeout_secs"));
    }

    #[test]
    fn test_pipeline_section_flattens_run_settings() {
        let toml = format!(
            "{MINIMAL}\n[pipeline]\nmax_concurrent_trials = 2\nacceptance = \"highest_confidence\"\n"
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.pipeline.run.max_concurrent_trials, 2);
        assert_eq!(config.pipeline.run.max_filings_per_sponsor, 5);
        assert_eq!(config.pipeline.acceptance, AcceptancePolicy::HighestConfidence);
    }

    #[test]
    fn test_caller_policy_and_host_overrides() {
        let toml = format!(
            "{MINIMAL}\n[caller]\nbase_delay_ms = 100\nrequests_per_second = 0\n\
             [caller.hosts.\"api.crossref.org\"]\nrequests_per_second = 2\n"
        );
        let config = Config::from_toml(&toml).unwrap();
        let policy = config.caller.to_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.requests_per_second, None);

        let hosts = config.caller.host_policies();
        assert_eq!(hosts.len(), 1, "an explicit table replaces the default overrides");
        assert_eq!(hosts[0].0, "api.crossref.org");
        assert_eq!(hosts[0].1.requests_per_second, Some(2));
        assert_eq!(hosts[0].1.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_default_host_limits_cover_sec_and_ncbi() {
        let hosts = CallerConfig::default().host_policies();
        let names: Vec<_> = hosts.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(names, vec!["efts.sec.gov", "eutils.ncbi.nlm.nih.gov", "www.sec.gov"]);
    }

    #[test]
    fn test_configured_key_wins_over_env() {
        let toml = format!("{MINIMAL}\n[publications]\npubmed_api_key = \"abc123\"\n");
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.pubmed_api_key().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_blank_key_counts_as_unset() {
        let blank = SecretString::from("  ".to_string());
        assert_eq!(resolve_key(Some(&blank), "TRIALINK_TEST_KEY_THAT_IS_NEVER_SET"), None);
        assert_eq!(resolve_key(None, "TRIALINK_TEST_KEY_THAT_IS_NEVER_SET"), None);
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let toml = format!("{MINIMAL}\n[llm]\napi_key = \"sk-very-secret\"\n");
        let config = Config::from_toml(&toml).unwrap();
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml(include_str!("../../../../trialink.example.toml")).unwrap();
        assert_eq!(config.caller.hosts.len(), 3);
        assert_eq!(config.publications.sources[0], PublicationSource::CrossRef);
    }
}
