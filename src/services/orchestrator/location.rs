use std::path::Path;
use url::Url;

/// Чем является строка расположения после нормализации
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Открывается обработчиком по умолчанию
    Url,
    /// Существующий файл, тоже уходит обработчику по умолчанию
    File,
    /// Папка или виртуальное расположение оболочки
    Folder,
}

/// Привести пользовательский ввод к виду, понятному навигации оболочки
pub fn normalize_location(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim();
    let expanded = expand_env_vars(trimmed);

    if is_bare_guid(&expanded) {
        return format!("::{}", expanded);
    }
    if looks_like_windows_path(&expanded) {
        return expanded.replace('/', "\\");
    }
    expanded
}

pub fn classify_location(location: &str) -> LocationKind {
    if is_external_url(location) {
        LocationKind::Url
    } else if Path::new(location).is_file() {
        LocationKind::File
    } else {
        LocationKind::Folder
    }
}

/// Раскрыть `%NAME%`; неизвестные переменные остаются как есть
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_bare_guid(s: &str) -> bool {
    s.len() == 38
        && s.starts_with('{')
        && s.ends_with('}')
        && s[1..37].chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn looks_like_windows_path(s: &str) -> bool {
    let bytes = s.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    drive || s.starts_with("\\\\") || s.starts_with("//")
}

/// Схема из одной буквы это диск (`C:\`), а `file:` и `shell:` открывает сама оболочка
fn is_external_url(location: &str) -> bool {
    match Url::parse(location) {
        Ok(url) => {
            let scheme = url.scheme();
            scheme.len() > 1 && scheme != "file" && scheme != "shell"
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_quotes_and_slashes() {
        assert_eq!(normalize_location("  \"C:/Users/Public\" "), "C:\\Users\\Public");
        assert_eq!(normalize_location("//server/share"), "\\\\server\\share");
        assert_eq!(normalize_location("shell:Downloads"), "shell:Downloads");
    }

    #[test]
    fn test_normalize_bare_guid() {
        assert_eq!(
            normalize_location("{20D04FE0-3AEA-1069-A2D8-08002B30309D}"),
            "::{20D04FE0-3AEA-1069-A2D8-08002B30309D}"
        );
        assert_eq!(
            normalize_location("::{20D04FE0-3AEA-1069-A2D8-08002B30309D}"),
            "::{20D04FE0-3AEA-1069-A2D8-08002B30309D}"
        );
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("SHELL_TABS_TEST_DIR", "C:\\Data");
        assert_eq!(normalize_location("%SHELL_TABS_TEST_DIR%/logs"), "C:\\Data\\logs");
        assert_eq!(expand_env_vars("%SHELL_TABS_NO_SUCH_VAR%\\x"), "%SHELL_TABS_NO_SUCH_VAR%\\x");
        assert_eq!(expand_env_vars("100% done"), "100% done");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify_location("https://example.com/page"), LocationKind::Url);
        assert_eq!(classify_location("C:\\Windows"), LocationKind::Folder);
        assert_eq!(classify_location("shell:Downloads"), LocationKind::Folder);
        assert_eq!(classify_location("file:///C:/Temp"), LocationKind::Folder);

        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(classify_location(&file.path().to_string_lossy()), LocationKind::File);
    }
}
