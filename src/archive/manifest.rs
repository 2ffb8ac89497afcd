//! `ComicInfo.xml` 元数据。

use crate::download::models::{ChapterRef, SeriesMeta};

/// 有序键值表；键首字母大写，空值不写入。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    entries: Vec<(String, String)>,
}

impl ArchiveManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按插入顺序追加；同名键覆盖原值但保留原位置。
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let key = capitalize(key.trim());
        let value = value.to_string();
        if key.is_empty() || value.trim().is_empty() {
            return self;
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn set_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = capitalize(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// 每章新建一份：日期取章节更新时间，`Count` 为作品最新章节号。
    pub fn for_chapter(series: &SeriesMeta, chapter: &ChapterRef, number: &str) -> Self {
        let updated = chapter.updated_at;
        let mut manifest = Self::new();
        manifest
            .set("Series", &series.title)
            .set("Number", number)
            .set("Title", &chapter.title)
            .set("Translator", &chapter.translator)
            .set_opt("LanguageISO", chapter.language.as_deref())
            .set("Year", updated.year())
            .set("Month", u8::from(updated.month()))
            .set("Day", updated.day())
            .set_opt("Count", series.last_chapter.as_deref())
            .set_opt("Writer", series.author.as_deref())
            .set_opt("Penciller", series.artist.as_deref());
        manifest
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ComicInfo>\n");
        for (key, value) in &self.entries {
            xml.push_str(&format!("\t<{key}>{}</{key}>\n", escape_xml(value)));
        }
        xml.push_str("</ComicInfo>\n");
        xml
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn keys_capitalized_empty_values_dropped() {
        let mut m = ArchiveManifest::new();
        m.set("series", "A & B <1>")
            .set("title", "")
            .set("number", 3)
            .set_opt("writer", None)
            .set("series", "A & B <2>");
        assert_eq!(
            m.to_xml(),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ComicInfo>\n\
             \t<Series>A &amp; B &lt;2&gt;</Series>\n\
             \t<Number>3</Number>\n\
             </ComicInfo>\n"
        );
    }

    #[test]
    fn chapter_manifest_field_order() {
        let series = SeriesMeta {
            title: "Series".into(),
            cover_url: None,
            last_chapter: Some("120".into()),
            author: Some("Writer W".into()),
            artist: None,
        };
        let mut chapter = ChapterRef::new("c-1", Some("7"), datetime!(2023-09-04 10:00:00 UTC));
        chapter.title = "Start".into();
        chapter.translator = "Team".into();
        chapter.language = Some("en".into());

        let m = ArchiveManifest::for_chapter(&series, &chapter, "7");
        let keys: Vec<&str> = m.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "Series",
                "Number",
                "Title",
                "Translator",
                "LanguageISO",
                "Year",
                "Month",
                "Day",
                "Count",
                "Writer"
            ]
        );
        assert_eq!(m.get("month"), Some("9"));
        assert_eq!(m.get("Day"), Some("4"));
        assert_eq!(m.get("Penciller"), None);
    }
}
