use wsp_domain::buildinfo::BuildInfo;
use wsp_domain::config::{Config, ConfigSeverity};
use wsp_sdk::PrimaryApi;

use crate::bootstrap::primary_client;

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("wsproxy doctor");
    println!("==============\n");

    let mut all_passed = true;

    // 1. Config file
    check_config_file(config_path, &mut all_passed);

    // 2. Config validation
    let config_ok = check_config_validation(config, &mut all_passed);

    // 3. Primary build info (same checks as /healthz-report)
    if config_ok {
        check_primary(config, &mut all_passed).await;
    } else {
        print_check("Primary reachable", false, "skipped (config invalid)".into());
    }

    // Summary
    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) -> bool {
    let issues = config.validate();
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      {issue}");
        }
    }
    if error_count > 0 {
        *all_passed = false;
    }
    error_count == 0
}

async fn check_primary(config: &Config, all_passed: &mut bool) {
    let client = match primary_client(config) {
        Ok(c) => c,
        Err(e) => {
            print_check("Primary reachable", false, format!("{e:#}"));
            *all_passed = false;
            return;
        }
    };

    let info = match client.build_info().await {
        Ok(info) => info,
        Err(e) => {
            print_check(
                "Primary reachable",
                false,
                format!("{} ({e})", config.proxy.primary_url),
            );
            *all_passed = false;
            return;
        }
    };
    print_check(
        "Primary reachable",
        true,
        format!("{} ({})", config.proxy.primary_url, info.version),
    );

    let is_primary = !info.workspace_proxy;
    print_check(
        "Primary is not a proxy",
        is_primary,
        if is_primary {
            "ok".into()
        } else {
            "dashboard url points at a workspace proxy".into()
        },
    );
    if !is_primary {
        *all_passed = false;
    }

    let own = BuildInfo::current();
    if !own.is_dev() && !wsp_domain::buildinfo::versions_match(&info.version, &own.version) {
        println!(
            "  [WARN] Version skew: primary {} != proxy {}",
            info.version, own.version
        );
    }
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
