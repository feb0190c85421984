//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use crawler_core::{CrawlMode, Platform};

/// Collect posts, comments and creator profiles from consumer social
/// platforms.
///
/// Exactly one of --keywords, --ids or --creators selects the crawl mode.
/// Session cookies and signing secrets come from the configured session
/// store; the crawler never performs logins itself.
#[derive(Parser, Debug)]
#[command(name = "crawler")]
#[command(author, version, about)]
pub struct Args {
    /// Platform to crawl (xhs, douyin, kuaishou, bilibili)
    #[arg(short, long)]
    pub platform: Platform,

    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Keywords to search for (comma-separated or repeated)
    #[arg(short, long, value_delimiter = ',')]
    pub keywords: Vec<String>,

    /// Platform-native post ids to fetch directly
    #[arg(short, long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Creator ids whose profiles and posts to collect
    #[arg(long, value_delimiter = ',')]
    pub creators: Vec<String>,

    /// Session-store account to crawl under
    #[arg(short, long)]
    pub account: Option<String>,

    /// JSON file with exported browser secrets
    /// ({cookies, local_storage, signature_values})
    #[arg(short, long)]
    pub secrets: Option<PathBuf>,

    /// Cookie string for the target platform, overriding the session store
    #[arg(long)]
    pub cookie: Option<String>,

    /// Print collected records as JSON lines on stdout
    #[arg(long)]
    pub dump: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Resolves the crawl mode from the selector flags.
    ///
    /// # Errors
    ///
    /// A usage message when zero or more than one selector was given.
    pub fn mode(&self) -> Result<CrawlMode, String> {
        let selectors = [
            !self.keywords.is_empty(),
            !self.ids.is_empty(),
            !self.creators.is_empty(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if selectors != 1 {
            return Err(
                "exactly one of --keywords, --ids or --creators must be given".to_string(),
            );
        }
        if !self.keywords.is_empty() {
            Ok(CrawlMode::Search {
                keywords: self.keywords.clone(),
            })
        } else if !self.ids.is_empty() {
            Ok(CrawlMode::Detail {
                ids: self.ids.clone(),
            })
        } else {
            Ok(CrawlMode::Creator {
                creator_ids: self.creators.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_search_mode_parses() {
        let args =
            Args::try_parse_from(["crawler", "-p", "xhs", "-k", "rust,tokio"]).unwrap();
        assert_eq!(args.platform, Platform::Xhs);
        assert_eq!(args.keywords, vec!["rust", "tokio"]);
        match args.mode().unwrap() {
            CrawlMode::Search { keywords } => assert_eq!(keywords.len(), 2),
            other => panic!("expected search mode, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_platform_aliases_accepted() {
        let args = Args::try_parse_from(["crawler", "-p", "dy", "-k", "x"]).unwrap();
        assert_eq!(args.platform, Platform::Douyin);

        let args = Args::try_parse_from(["crawler", "-p", "bili", "-k", "x"]).unwrap();
        assert_eq!(args.platform, Platform::Bilibili);
    }

    #[test]
    fn test_cli_unknown_platform_rejected() {
        let result = Args::try_parse_from(["crawler", "-p", "weibo", "-k", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_detail_mode_parses() {
        let args = Args::try_parse_from(["crawler", "-p", "kuaishou", "-i", "a1,b2"]).unwrap();
        match args.mode().unwrap() {
            CrawlMode::Detail { ids } => assert_eq!(ids, vec!["a1", "b2"]),
            other => panic!("expected detail mode, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_creator_mode_parses() {
        let args =
            Args::try_parse_from(["crawler", "-p", "bilibili", "--creators", "12345"]).unwrap();
        match args.mode().unwrap() {
            CrawlMode::Creator { creator_ids } => assert_eq!(creator_ids, vec!["12345"]),
            other => panic!("expected creator mode, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_no_selector_rejected() {
        let args = Args::try_parse_from(["crawler", "-p", "xhs"]).unwrap();
        assert!(args.mode().is_err());
    }

    #[test]
    fn test_cli_two_selectors_rejected() {
        let args =
            Args::try_parse_from(["crawler", "-p", "xhs", "-k", "a", "-i", "b"]).unwrap();
        assert!(args.mode().is_err());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["crawler", "-p", "xhs", "-k", "a", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["crawler", "--help"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
