//! Best-effort repair of mis-decoded text.
//!
//! Models served through several proxies sometimes return UTF-8 that
//! was decoded as Latin-1 or Windows-1252 along the way ("Ã¼" instead
//! of "ü", "â€™" instead of "’"). Runs of such characters are mapped
//! back to bytes and re-decoded when that yields valid UTF-8.

use log::{debug, warn};

/// Windows-1252 code points for bytes 0x80..=0x9F.
/// Undefined bytes keep their C1 control code point.
const CP1252_HIGH: [char; 32] = [
  '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}',
  '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
  '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}',
  '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
  '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}',
  '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
  '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
  '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

/// Single byte a character would have had in Windows-1252 / Latin-1
fn legacy_byte(c: char) -> Option<u8>
{   let code = c as u32;
    if code < 0x80
    {   return Some(code as u8);
    }
    if let Some(pos) = CP1252_HIGH.iter().position(|&h| h == c)
    {   return Some(0x80 + pos as u8);
    }
    if (0xA0..=0xFF).contains(&code)
    {   return Some(code as u8);
    }
    None
}

/// Lead bytes of multi-byte UTF-8 sequences as Latin-1 characters.
/// Mojibake always starts with one of them.
fn is_mojibake_lead(c: char) -> bool
{   matches!(c as u32, 0xC2..=0xF4)
}

fn is_implausible(c: char) -> bool
{   c.is_control() && !matches!(c, '\n' | '\r' | '\t')
}

/// Re-decode one run of legacy-encodable characters.
/// Returns `None` when the run is not mojibake.
fn repair_run(run: &str) -> Result<Option<String>, crate::error::Error>
{   if !run.chars().any(is_mojibake_lead)
    {   return Ok(None);
    }

    let bytes: Vec<u8> = run.chars()
      .filter_map(legacy_byte)
      .collect();

    let decoded = match String::from_utf8(bytes)
    {   Ok(s) => s
      , Err(_) => return Ok(None)
    };

    if decoded == run
    {   return Ok(None);
    }

    if let Some(c) = decoded.chars().find(|&c| is_implausible(c))
    {   return Err(crate::error::Error::TextRepair(
          format!("repair of {:?} produced control char {:?}", run, c)
        ));
    }

    Ok(Some(decoded))
}

/// Fix mojibake in `text`. Text without mojibake comes back unchanged.
pub fn fix_text(text: &str) -> Result<String, crate::error::Error>
{   let mut out = String::with_capacity(text.len());
    let mut run = String::new();

    for c in text.chars()
    {   if c.is_ascii() || legacy_byte(c).is_none()
        {   flush_run(&mut run, &mut out)?;
            out.push(c);
        } else
        {   run.push(c);
        }
    }
    flush_run(&mut run, &mut out)?;

    Ok(out)
}

// A run is a maximal sequence of non-ASCII legacy-encodable chars.
// UTF-8 continuation bytes are never ASCII, so mojibake never spans runs.
fn flush_run(
  run: &mut String
, out: &mut String
) -> Result<(), crate::error::Error>
{   if run.is_empty()
    {   return Ok(());
    }
    match repair_run(run)?
    {   Some(fixed) => {
          debug!("Repaired mojibake {:?} -> {:?}", run, fixed);
          out.push_str(&fixed);
        }
      , None => out.push_str(run)
    }
    run.clear();
    Ok(())
}

/// Repair that never fails: on error the original text is kept.
pub fn repair_or_keep(text: String) -> String
{   match fix_text(&text)
    {   Ok(fixed) => fixed
      , Err(e) => {
          warn!("Text repair skipped: {}", e);
          text
        }
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn test_clean_text_is_unchanged()
    {   for s in [
          "Touchdown", "Müller läuft über die Line of Scrimmage",
          "quotes “like this” and emoji 🏈", ""
        ]
        {   assert_eq!(fix_text(s).unwrap(), s);
        }
    }

    #[test]
    fn test_latin1_mojibake_is_fixed()
    {   assert_eq!(fix_text("Ã¼ber").unwrap(), "über");
        assert_eq!(fix_text("FuÃŸball").unwrap(), "Fußball");
    }

    #[test]
    fn test_cp1252_mojibake_is_fixed()
    {   assert_eq!(
          fix_text("the runnerâ€™s knee").unwrap(),
          "the runner’s knee"
        );
    }

    #[test]
    fn test_mixed_text_keeps_valid_parts()
    {   assert_eq!(
          fix_text("ü and Ã¤ 🏈").unwrap(),
          "ü and ä 🏈"
        );
    }

    #[test]
    fn test_implausible_repair_is_an_error()
    {   // "Â\u{81}" decodes to the C1 control U+0081
        let result = fix_text("Â\u{81}");
        assert!(matches!(
          result,
          Err(crate::error::Error::TextRepair(_))
        ));
        assert_eq!(repair_or_keep("Â\u{81}".to_string()), "Â\u{81}");
    }
}
