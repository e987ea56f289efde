//! Keyword expansion applied to fetched content
//!
//! Supported keywords: `$Revision$`, `$Author$`, `$Date$`, `$Filename$`,
//! `$Header$` and `$Log$`. Both the bare form and an already-expanded form
//! (`$Revision: 1.3 $`) are rewritten, so expanding twice is stable.

use crate::revision::RevisionHeader;

/// Values substituted into keywords for one revision.
#[derive(Debug, Clone)]
pub struct KeywordContext<'a> {
    pub short_name: &'a str,
    pub revision: &'a RevisionHeader,
    pub comment_prefix: &'a str,
}

const KEYWORDS: &[&str] = &["Revision", "Author", "Date", "Filename", "Header", "Log"];

impl KeywordContext<'_> {
    fn value_for(&self, keyword: &str) -> String {
        let rev = self.revision;
        let date = rev.checkin_date.format("%Y/%m/%d %H:%M:%S").to_string();
        match keyword {
            "Revision" => rev.revision_string(),
            "Author" => rev.creator.clone(),
            "Date" => date,
            "Filename" => self.short_name.to_string(),
            "Header" => format!(
                "{} {} {} {}",
                self.short_name,
                rev.revision_string(),
                date,
                rev.creator
            ),
            "Log" => format!(
                "{}\n{}Revision {}  {}  {}\n{}{}",
                self.short_name,
                self.comment_prefix,
                rev.revision_string(),
                date,
                rev.creator,
                self.comment_prefix,
                rev.description.replace('\n', &format!("\n{}", self.comment_prefix)),
            ),
            _ => String::new(),
        }
    }
}

/// Expand keywords in `content`. Content that is not valid UTF-8 is
/// returned unchanged.
pub fn expand(content: &[u8], ctx: &KeywordContext<'_>) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(content) else {
        return content.to_vec();
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match match_keyword(after) {
            Some((keyword, consumed)) => {
                out.push_str(&format!("${}: {} $", keyword, ctx.value_for(keyword)));
                rest = &after[consumed..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out.into_bytes()
}

/// Match `Keyword$` or `Keyword: ... $` at the start of `s`. Returns the
/// keyword and the bytes consumed after the opening `$`.
fn match_keyword(s: &str) -> Option<(&'static str, usize)> {
    for keyword in KEYWORDS {
        let Some(tail) = s.strip_prefix(keyword) else {
            continue;
        };
        if tail.starts_with('$') {
            return Some((keyword, keyword.len() + 1));
        }
        if let Some(value) = tail.strip_prefix(':') {
            // Expanded values never span a line, except for $Log$.
            let end = value.find('$')?;
            if *keyword != "Log" && value[..end].contains('\n') {
                return None;
            }
            return Some((keyword, keyword.len() + 1 + end + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::StorageKind;
    use chrono::{TimeZone, Utc};

    fn revision() -> RevisionHeader {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        RevisionHeader {
            descriptor: "1.3".parse().unwrap(),
            checkin_date: date,
            edit_date: date,
            creator: "alice".to_string(),
            locker: None,
            is_locked: false,
            is_tip: true,
            compressed: false,
            storage: StorageKind::Full,
            content_size: 0,
            stored_size: 0,
            description: "tidy".to_string(),
        }
    }

    #[test]
    fn test_expand_bare_keywords() {
        let rev = revision();
        let ctx = KeywordContext {
            short_name: "foo.c",
            revision: &rev,
            comment_prefix: "// ",
        };
        let out = expand(b"/* $Revision$ by $Author$ */", &ctx);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "/* $Revision: 1.3 $ by $Author: alice $ */"
        );
    }

    #[test]
    fn test_reexpansion_is_stable() {
        let rev = revision();
        let ctx = KeywordContext {
            short_name: "foo.c",
            revision: &rev,
            comment_prefix: "",
        };
        let once = expand(b"$Header$ and $Date$", &ctx);
        let twice = expand(&once, &ctx);
        assert_eq!(once, twice);
        assert!(String::from_utf8(once)
            .unwrap()
            .contains("$Date: 2024/03/01 12:30:00 $"));
    }

    #[test]
    fn test_unknown_and_dangling_dollars_untouched() {
        let rev = revision();
        let ctx = KeywordContext {
            short_name: "foo.c",
            revision: &rev,
            comment_prefix: "",
        };
        let input = b"price: $5 and $Unknown$ and $Revision";
        assert_eq!(expand(input, &ctx), input.to_vec());
    }

    #[test]
    fn test_binary_content_untouched() {
        let rev = revision();
        let ctx = KeywordContext {
            short_name: "foo.bin",
            revision: &rev,
            comment_prefix: "",
        };
        let input = vec![0xff, 0xfe, b'$', b'R'];
        assert_eq!(expand(&input, &ctx), input);
    }
}
