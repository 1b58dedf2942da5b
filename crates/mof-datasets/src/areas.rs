//! Seed data for the area hierarchy and its alias table.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaKind {
    Country,
    Province,
    City,
    Borough,
}

impl AreaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AreaKind::Country => "country",
            AreaKind::Province => "province",
            AreaKind::City => "city",
            AreaKind::Borough => "borough",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AreaSeed {
    pub slug: &'static str,
    pub kind: AreaKind,
    pub name_fr: &'static str,
    pub name_en: &'static str,
    pub parent: Option<&'static str>,
}

const fn borough(slug: &'static str, name: &'static str) -> AreaSeed {
    AreaSeed {
        slug,
        kind: AreaKind::Borough,
        name_fr: name,
        name_en: name,
        parent: Some("montreal"),
    }
}

/// Parents always precede children.
pub const AREAS: &[AreaSeed] = &[
    AreaSeed {
        slug: "canada",
        kind: AreaKind::Country,
        name_fr: "Canada",
        name_en: "Canada",
        parent: None,
    },
    AreaSeed {
        slug: "quebec",
        kind: AreaKind::Province,
        name_fr: "Québec",
        name_en: "Quebec",
        parent: Some("canada"),
    },
    AreaSeed {
        slug: "montreal",
        kind: AreaKind::City,
        name_fr: "Montréal",
        name_en: "Montreal",
        parent: Some("quebec"),
    },
    borough("ahuntsic-cartierville", "Ahuntsic-Cartierville"),
    borough("anjou", "Anjou"),
    borough("cote-des-neiges-notre-dame-de-grace", "Côte-des-Neiges-Notre-Dame-de-Grâce"),
    borough("lachine", "Lachine"),
    borough("lasalle", "LaSalle"),
    borough("le-plateau-mont-royal", "Le Plateau-Mont-Royal"),
    borough("le-sud-ouest", "Le Sud-Ouest"),
    borough("l-ile-bizard-sainte-genevieve", "L'Île-Bizard-Sainte-Geneviève"),
    borough("mercier-hochelaga-maisonneuve", "Mercier-Hochelaga-Maisonneuve"),
    borough("montreal-nord", "Montréal-Nord"),
    borough("outremont", "Outremont"),
    borough("pierrefonds-roxboro", "Pierrefonds-Roxboro"),
    borough("riviere-des-prairies-pointe-aux-trembles", "Rivière-des-Prairies-Pointe-aux-Trembles"),
    borough("rosemont-la-petite-patrie", "Rosemont-La Petite-Patrie"),
    borough("saint-laurent", "Saint-Laurent"),
    borough("saint-leonard", "Saint-Léonard"),
    borough("verdun", "Verdun"),
    borough("ville-marie", "Ville-Marie"),
    borough("villeray-saint-michel-parc-extension", "Villeray-Saint-Michel-Parc-Extension"),
];

/// Raw dataset spelling -> canonical borough name.
pub const BOROUGH_ALIASES: &[(&str, &str)] = &[
    ("Côte-des-Neiges—Notre-Dame-de-Grâce", "Côte-des-Neiges-Notre-Dame-de-Grâce"),
    ("Mercier—Hochelaga-Maisonneuve", "Mercier-Hochelaga-Maisonneuve"),
    ("L'Île-Bizard—Sainte-Geneviève", "L'Île-Bizard-Sainte-Geneviève"),
    ("Rivière-des-Prairies—Pointe-aux-Trembles", "Rivière-des-Prairies-Pointe-aux-Trembles"),
    ("Villeray—Saint-Michel—Parc-Extension", "Villeray-Saint-Michel-Parc-Extension"),
    ("Rosemont—La Petite-Patrie", "Rosemont-La Petite-Patrie"),
    ("Plateau-Mont-Royal", "Le Plateau-Mont-Royal"),
    ("Plateau Mont-Royal", "Le Plateau-Mont-Royal"),
    ("Sud-Ouest", "Le Sud-Ouest"),
    ("Montreal-Nord", "Montréal-Nord"),
    ("Saint-Leonard", "Saint-Léonard"),
    ("Ile-Bizard-Sainte-Genevieve", "L'Île-Bizard-Sainte-Geneviève"),
    ("CDN-NDG", "Côte-des-Neiges-Notre-Dame-de-Grâce"),
    ("RDP-PAT", "Rivière-des-Prairies-Pointe-aux-Trembles"),
];

pub const POPULATION_ATTRIBUTE: &str = "population";
/// 2016 census day.
pub const POPULATION_EFFECTIVE_DATE: &str = "2016-05-10";

/// Borough slug -> 2016 census population.
pub const BOROUGH_POPULATION_2016: &[(&str, i64)] = &[
    ("ahuntsic-cartierville", 134_245),
    ("anjou", 42_796),
    ("cote-des-neiges-notre-dame-de-grace", 166_520),
    ("lachine", 44_489),
    ("lasalle", 76_853),
    ("le-plateau-mont-royal", 104_000),
    ("le-sud-ouest", 78_151),
    ("l-ile-bizard-sainte-genevieve", 18_413),
    ("mercier-hochelaga-maisonneuve", 136_024),
    ("montreal-nord", 84_234),
    ("outremont", 23_954),
    ("pierrefonds-roxboro", 69_297),
    ("riviere-des-prairies-pointe-aux-trembles", 106_743),
    ("rosemont-la-petite-patrie", 139_590),
    ("saint-laurent", 98_828),
    ("saint-leonard", 78_305),
    ("verdun", 69_229),
    ("ville-marie", 89_170),
    ("villeray-saint-michel-parc-extension", 143_853),
];

pub fn boroughs() -> impl Iterator<Item = &'static AreaSeed> {
    AREAS.iter().filter(|a| a.kind == AreaKind::Borough)
}

/// Slug of the borough whose canonical name is `canonical`, if any.
pub fn borough_slug(canonical: &str) -> Option<&'static str> {
    boroughs().find(|a| a.name_fr == canonical).map(|a| a.slug)
}
