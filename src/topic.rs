//! Broker topic path canonicalization
//!
//! Every topic that leaves or enters the bridge goes through [`sanitize`]:
//! lowercase, diacritic-free, no spaces or backslashes, segments joined by
//! `/`. The function is idempotent, so layered callers may re-sanitize an
//! already-canonical path without changing it.

/// Canonicalize an arbitrary topic path.
///
/// Splits on `/`, then per segment: drops backslashes, trims, replaces
/// interior spaces with `_`, lowercases and folds diacritics to ASCII.
/// Empty or whitespace-only input yields an empty string, never an error.
pub fn sanitize(raw: &str) -> String {
    raw.split('/')
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Full topic for an addon-scoped path: `sanitize(addon_id + "/" + topic)`.
pub fn addon_topic(addon_id: &str, topic: &str) -> String {
    sanitize(&format!("{}/{}", addon_id, topic))
}

/// Full broker topic for this machine:
/// `sanitize(prefix + "/" + machine + "/" + suffix)`.
pub fn machine_topic(prefix: &str, machine: &str, suffix: &str) -> String {
    sanitize(&format!("{}/{}/{}", prefix, machine, suffix))
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .replace('\\', "")
        .trim()
        .replace(' ', "_")
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(fold_diacritic)
        .collect()
}

/// Fold common Latin diacritics to their ASCII base character.
fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => 'o',
        'ř' => 'r',
        'ś' | 'š' => 's',
        'ť' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        'ß' => 's',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize("Commands/Run"), "commands/run");
    }

    #[test]
    fn test_sanitize_spaces_become_underscores() {
        assert_eq!(sanitize("My Topic/Sub Path"), "my_topic/sub_path");
    }

    #[test]
    fn test_sanitize_strips_backslashes() {
        assert_eq!(sanitize("DOMAIN\\machine/State"), "domainmachine/state");
    }

    #[test]
    fn test_sanitize_diacritics() {
        assert_eq!(sanitize("Caféteria/Über"), "cafeteria/uber");
    }

    #[test]
    fn test_sanitize_trims_segments() {
        assert_eq!(sanitize("  office / pc "), "office/pc");
    }

    #[test]
    fn test_sanitize_empty_and_whitespace() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("   "), "");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs = [
            "Commands/Run",
            "home/OFFICE-PC/Processes/Chrome/State",
            "Café Corner\\/weird  path",
            "",
            "   ",
            "a//b",
            "ÀÉÎÕÜ/ñ ç",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn test_addon_topic_scenario_a() {
        assert_eq!(addon_topic("Commands", "run"), "commands/run");
    }

    #[test]
    fn test_machine_topic_scenario_b() {
        assert_eq!(
            machine_topic("home", "OFFICE-PC", "Processes/Chrome/State"),
            "home/office-pc/processes/chrome/state"
        );
    }
}
