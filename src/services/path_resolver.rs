//! Сравнение расположений пространства имён оболочки.
//!
//! Расположение оболочки это не только путь файловой системы: виртуальные папки
//! ("Этот компьютер", "Корзина", "Панель управления") имеют несколько записей
//! (`::{GUID}`, `shell:::{GUID}`, `shell:MyComputerFolder`, отображаемое имя),
//! а пути бывают в `file://`-форме с процент-кодированием или с другими
//! разделителями. Все формы приводятся к [`ItemId`], после чего сравниваются
//! сначала структурно, затем по нормализованному отображаемому пути.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use url::Url;

use crate::error::{Result, ShellTabsError};

/// Виртуальная папка оболочки без пути на диске
struct VirtualFolder {
    clsid: &'static str,
    shell_name: Option<&'static str>,
    display_name: &'static str,
    aliases: &'static [&'static str],
}

static VIRTUAL_FOLDERS: &[VirtualFolder] = &[
    VirtualFolder {
        clsid: "{20D04FE0-3AEA-1069-A2D8-08002B30309D}",
        shell_name: Some("MyComputerFolder"),
        display_name: "This PC",
        aliases: &["Computer", "My Computer"],
    },
    VirtualFolder {
        clsid: "{645FF040-5081-101B-9F08-00AA002F954E}",
        shell_name: Some("RecycleBinFolder"),
        display_name: "Recycle Bin",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{26EE0668-A00A-44D7-9371-BEB064C98683}",
        shell_name: Some("ControlPanelFolder"),
        display_name: "Control Panel",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{21EC2020-3AEA-1069-A2DD-08002B30309D}",
        shell_name: None,
        display_name: "All Control Panel Items",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{F02C1A0D-BE21-4350-88B0-7367FC96EF3C}",
        shell_name: Some("NetworkPlacesFolder"),
        display_name: "Network",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{F874310E-B6B7-47DC-BC84-B9E6B38F5903}",
        shell_name: None,
        display_name: "Home",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{679F85CB-0220-4080-B29B-5540CC05AAB6}",
        shell_name: None,
        display_name: "Quick access",
        aliases: &[],
    },
    VirtualFolder {
        clsid: "{031E4825-7B94-4DC3-B131-E946B44C8DD5}",
        shell_name: Some("Libraries"),
        display_name: "Libraries",
        aliases: &[],
    },
];

/// Именованные папки оболочки, у которых есть путь на диске
static FILESYSTEM_FOLDERS: Lazy<HashMap<&'static str, fn() -> Option<PathBuf>>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, fn() -> Option<PathBuf>> = HashMap::new();
    map.insert("desktop", dirs::desktop_dir);
    map.insert("downloads", dirs::download_dir);
    map.insert("personal", dirs::document_dir);
    map.insert("documents", dirs::document_dir);
    map.insert("my pictures", dirs::picture_dir);
    map.insert("my music", dirs::audio_dir);
    map.insert("my video", dirs::video_dir);
    map.insert("profile", dirs::home_dir);
    map
});

// Индексы по всем написаниям виртуальных папок (в нижнем регистре)
static CLSID_INDEX: Lazy<HashMap<String, &'static VirtualFolder>> = Lazy::new(|| {
    VIRTUAL_FOLDERS
        .iter()
        .map(|folder| (folder.clsid.to_ascii_uppercase(), folder))
        .collect()
});

static NAME_INDEX: Lazy<HashMap<String, &'static VirtualFolder>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for folder in VIRTUAL_FOLDERS {
        map.insert(folder.display_name.to_lowercase(), folder);
        for alias in folder.aliases {
            map.insert(alias.to_lowercase(), folder);
        }
    }
    map
});

static SHELL_NAME_INDEX: Lazy<HashMap<String, &'static VirtualFolder>> = Lazy::new(|| {
    VIRTUAL_FOLDERS
        .iter()
        .filter_map(|folder| folder.shell_name.map(|name| (name.to_lowercase(), folder)))
        .collect()
});

/// Элемент идентификатора расположения
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdSegment {
    /// Виртуальная папка, GUID в верхнем регистре с фигурными скобками
    Clsid(String),
    /// Обычный элемент пути (корень диска, UNC-сервер, имя папки)
    Name(String),
}

/// Разобранный идентификатор расположения. Владеет своими данными:
/// освобождение происходит при выходе из области видимости.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemId {
    segments: Vec<IdSegment>,
}

impl ItemId {
    pub fn segments(&self) -> &[IdSegment] {
        &self.segments
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.segments.first(), Some(IdSegment::Clsid(_)))
    }

    /// Нормализованный отображаемый путь
    pub fn display_path(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            let text = match segment {
                IdSegment::Clsid(clsid) => CLSID_INDEX
                    .get(clsid)
                    .map(|folder| folder.display_name.to_string())
                    .unwrap_or_else(|| format!("::{}", clsid)),
                IdSegment::Name(name) => name.clone(),
            };
            if i > 0 && !out.ends_with('\\') {
                out.push('\\');
            }
            out.push_str(&text);
        }
        out
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_path())
    }
}

/// Разрешение и сравнение расположений оболочки
#[derive(Debug, Default, Clone, Copy)]
pub struct PathResolver;

impl PathResolver {
    pub fn new() -> Self {
        Self
    }

    /// Разобрать расположение в идентификатор
    pub fn path_to_id(&self, path: &str) -> Result<ItemId> {
        let path = path.trim();
        if path.is_empty() {
            return ShellTabsError::not_found("пустое расположение");
        }

        if Self::has_prefix(path, "file:") {
            let decoded = Self::file_url_to_path(path)?;
            return Ok(Self::parse_filesystem(&decoded));
        }

        if Self::has_prefix(path, "shell:") {
            return self.parse_shell_path(&path[6..]);
        }

        if path.starts_with("::") {
            return Self::parse_namespace_chain(path);
        }

        if Self::looks_like_guid(path) {
            return Self::parse_namespace_chain(&format!("::{}", path));
        }

        if let Some(folder) = NAME_INDEX.get(&path.to_lowercase()) {
            return Ok(ItemId {
                segments: vec![IdSegment::Clsid(folder.clsid.to_ascii_uppercase())],
            });
        }

        Ok(Self::parse_filesystem(path))
    }

    /// Структурное сравнение, при неудаче сравнение нормализованных путей без учёта регистра
    pub fn ids_equivalent(&self, a: &ItemId, b: &ItemId) -> bool {
        if a == b {
            return true;
        }
        a.display_path().to_lowercase() == b.display_path().to_lowercase()
    }

    pub fn paths_equivalent(&self, a: &str, b: &str) -> bool {
        match (self.path_to_id(a), self.path_to_id(b)) {
            (Ok(a), Ok(b)) => self.ids_equivalent(&a, &b),
            _ => false,
        }
    }

    /// Сравнение с заранее разобранным идентификатором (для циклов по реестру)
    pub fn id_equivalent_to_path(&self, id: &ItemId, path: &str) -> bool {
        match self.path_to_id(path) {
            Ok(other) => self.ids_equivalent(id, &other),
            Err(_) => false,
        }
    }

    /// Ключ для группировки одинаковых расположений
    pub fn canonical_key(&self, path: &str) -> Option<String> {
        self.path_to_id(path)
            .ok()
            .map(|id| id.display_path().to_lowercase())
    }

    fn parse_shell_path(&self, rest: &str) -> Result<ItemId> {
        if rest.starts_with("::") {
            return Self::parse_namespace_chain(rest);
        }

        let (head, tail) = match rest.find(['\\', '/']) {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };
        let head_lower = head.to_lowercase();

        let mut id = if let Some(folder) = SHELL_NAME_INDEX.get(&head_lower) {
            ItemId {
                segments: vec![IdSegment::Clsid(folder.clsid.to_ascii_uppercase())],
            }
        } else if let Some(resolve) = FILESYSTEM_FOLDERS.get(head_lower.as_str()) {
            let dir = resolve().ok_or_else(|| {
                ShellTabsError::NotFound(format!("папка shell:{} не найдена", head))
            })?;
            Self::parse_filesystem(&dir.to_string_lossy())
        } else {
            return ShellTabsError::not_found(format!("неизвестная папка оболочки shell:{}", head));
        };

        Self::push_segments(&mut id.segments, tail);
        Ok(id)
    }

    fn parse_namespace_chain(path: &str) -> Result<ItemId> {
        let mut segments = Vec::new();
        for part in path.split(['\\', '/']).filter(|p| !p.is_empty()) {
            match part.strip_prefix("::") {
                Some(guid) if Self::looks_like_guid(guid) => {
                    segments.push(IdSegment::Clsid(guid.to_ascii_uppercase()));
                }
                Some(_) => {
                    return ShellTabsError::not_found(format!("неверный GUID в \"{}\"", path));
                }
                None => Self::push_segments(&mut segments, part),
            }
        }
        if segments.is_empty() {
            return ShellTabsError::not_found(format!("пустая цепочка в \"{}\"", path));
        }
        Ok(ItemId { segments })
    }

    fn parse_filesystem(path: &str) -> ItemId {
        let unified = path.replace('/', "\\");
        let mut segments = Vec::new();

        let rest = if let Some(unc) = unified.strip_prefix("\\\\") {
            let (server, rest) = match unc.find('\\') {
                Some(pos) => (&unc[..pos], &unc[pos + 1..]),
                None => (unc, ""),
            };
            segments.push(IdSegment::Name(format!("\\\\{}", server)));
            rest.to_string()
        } else if let Some(rest) = unified.strip_prefix('\\') {
            segments.push(IdSegment::Name("\\".to_string()));
            rest.to_string()
        } else {
            unified
        };

        Self::push_segments(&mut segments, &rest);
        ItemId { segments }
    }

    fn push_segments(segments: &mut Vec<IdSegment>, rest: &str) {
        for part in rest.split(['\\', '/']).filter(|p| !p.is_empty()) {
            match part {
                "." => {}
                ".." => {
                    if segments.len() > 1 {
                        segments.pop();
                    }
                }
                _ => segments.push(IdSegment::Name(part.to_string())),
            }
        }
    }

    fn file_url_to_path(raw: &str) -> Result<String> {
        let url = Url::parse(raw)
            .map_err(|e| ShellTabsError::NotFound(format!("неверный file URL \"{}\": {}", raw, e)))?;
        let path = percent_decode_str(url.path()).decode_utf8_lossy().to_string();

        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            return Ok(format!("\\\\{}{}", host, path));
        }

        // file:///C:/dir -> C:/dir
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' {
            return Ok(path[1..].to_string());
        }
        Ok(path)
    }

    fn has_prefix(path: &str, prefix: &str) -> bool {
        path.len() > prefix.len()
            && path
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    }

    fn looks_like_guid(s: &str) -> bool {
        let bytes = s.as_bytes();
        bytes.len() == 38
            && bytes[0] == b'{'
            && bytes[37] == b'}'
            && s[1..37]
                .char_indices()
                .all(|(i, c)| if matches!(i, 8 | 13 | 18 | 23) { c == '-' } else { c.is_ascii_hexdigit() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THIS_PC: &str = "::{20D04FE0-3AEA-1069-A2D8-08002B30309D}";

    #[test]
    fn test_virtual_folder_forms_are_equivalent() {
        let resolver = PathResolver::new();
        let forms = [
            THIS_PC,
            "shell:::{20d04fe0-3aea-1069-a2d8-08002b30309d}",
            "shell:MyComputerFolder",
            "This PC",
            "{20D04FE0-3AEA-1069-A2D8-08002B30309D}",
        ];

        for a in &forms {
            assert!(resolver.paths_equivalent(a, a), "рефлексивность для {}", a);
            for b in &forms {
                assert!(resolver.paths_equivalent(a, b), "{} ~ {}", a, b);
                assert!(resolver.paths_equivalent(b, a), "{} ~ {}", b, a);
            }
        }
    }

    #[test]
    fn test_distinct_virtual_folders_differ() {
        let resolver = PathResolver::new();
        assert!(!resolver.paths_equivalent(THIS_PC, "shell:RecycleBinFolder"));
        assert!(resolver.paths_equivalent("Recycle Bin", "shell:RecycleBinFolder"));
    }

    #[test]
    fn test_filesystem_paths_fallback_to_case_insensitive() {
        let resolver = PathResolver::new();
        assert!(resolver.paths_equivalent("C:\\Users\\Me", "c:/users/me/"));
        assert!(resolver.paths_equivalent("C:\\Users\\Me\\Docs\\..", "C:\\Users\\Me"));
        assert!(!resolver.paths_equivalent("C:\\Users\\Me", "C:\\Users\\You"));
    }

    #[test]
    fn test_file_url_with_percent_encoding() {
        let resolver = PathResolver::new();
        assert!(resolver.paths_equivalent("file:///C:/My%20Files/a", "C:\\My Files\\a"));
        assert!(resolver.paths_equivalent("file://server/share/x", "\\\\server\\share\\x"));
    }

    #[test]
    fn test_resolution_failure_is_not_equivalent() {
        let resolver = PathResolver::new();
        assert!(!resolver.paths_equivalent("", ""));
        assert!(!resolver.paths_equivalent("shell:NoSuchFolder", "shell:NoSuchFolder"));
        assert!(resolver.path_to_id("::{not-a-guid}").is_err());
    }

    #[test]
    fn test_id_overload_matches_path_overload() {
        let resolver = PathResolver::new();
        let id = resolver.path_to_id("C:\\Temp").unwrap();
        assert!(resolver.id_equivalent_to_path(&id, "c:\\temp\\"));
        assert!(!resolver.id_equivalent_to_path(&id, "shell:NoSuchFolder"));
    }

    #[test]
    fn test_display_path() {
        let resolver = PathResolver::new();
        let id = resolver.path_to_id("shell:::{20D04FE0-3AEA-1069-A2D8-08002B30309D}").unwrap();
        assert!(id.is_virtual());
        assert_eq!(id.display_path(), "This PC");

        let id = resolver.path_to_id("D:/a//b/").unwrap();
        assert_eq!(id.display_path(), "D:\\a\\b");

        let id = resolver.path_to_id("\\\\srv\\share").unwrap();
        assert_eq!(id.display_path(), "\\\\srv\\share");
    }

    #[test]
    fn test_canonical_key() {
        let resolver = PathResolver::new();
        assert_eq!(resolver.canonical_key("C:/Temp/"), resolver.canonical_key("c:\\temp"));
        assert_eq!(resolver.canonical_key(""), None);
    }
}
