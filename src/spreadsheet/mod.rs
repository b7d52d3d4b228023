//! Excel input and output

pub mod google;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use calamine::{Data, Range, Reader, open_workbook_auto};
use rust_xlsxwriter::{Workbook, Worksheet};
use tracing::{debug, info};

use crate::extract::article_from_cell;
use crate::models::PriceRow;
use crate::traits::ResultSink;

/// Output columns, shared by every sink that writes a table
pub const HEADER: [&str; 11] = [
    "Дата",
    "Кабинет",
    "Артикул",
    "Название",
    "Цена до СПП",
    "Цена после СПП",
    "Цена с картой",
    "Скидка %",
    "СПП %",
    "Остаток",
    "Статус",
];

pub const ARTICLES_HEADER: [&str; 2] = ["Артикулы WB (nmID)", "Кабинет"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Articles from the first two columns of the first candidate sheet found,
/// de-duplicated in first-seen order.
pub fn read_articles(path: &Path, sheet_candidates: &[String]) -> Result<Vec<String>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let sheet_names = workbook.sheet_names();
    let sheet = sheet_candidates
        .iter()
        .find(|candidate| sheet_names.contains(candidate))
        .or_else(|| sheet_names.first())
        .cloned()
        .with_context(|| format!("{} has no sheets", path.display()))?;

    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("Failed to read sheet '{sheet}'"))?;

    let mut seen = HashSet::new();
    let articles: Vec<String> = range
        .rows()
        .filter_map(|row| row.iter().take(2).find_map(|cell| article_from_cell(&cell_text(cell))))
        .filter(|article| seen.insert(article.clone()))
        .collect();

    info!("Read {} articles from sheet '{}' of {}", articles.len(), sheet, path.display());
    Ok(articles)
}

/// Write the article list produced by `load-ids`, one `(article, cabinet)` per row.
///
/// The list goes to the first sheet. Other sheets of an existing workbook are
/// carried over by value; formatting and formulas are not.
pub fn write_articles(path: &Path, sheet: &str, articles: &[(String, String)]) -> Result<()> {
    let others = if path.exists() {
        existing_sheets(path, sheet)?
    } else {
        Vec::new()
    };

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet)?;

    write_strings(worksheet, 0, &ARTICLES_HEADER)?;
    for (index, (article, cabinet)) in articles.iter().enumerate() {
        let row = row_number(index + 1)?;
        match article.parse::<f64>() {
            Ok(number) => worksheet.write_number(row, 0, number)?,
            Err(_) => worksheet.write_string(row, 0, article.as_str())?,
        };
        worksheet.write_string(row, 1, cabinet.as_str())?;
    }

    for (name, range) in &others {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(name.as_str())?;
        copy_range(worksheet, range)?;
    }

    save(&mut workbook, path)?;
    info!(
        "Saved {} articles to {} (kept {} other sheets)",
        articles.len(),
        path.display(),
        others.len()
    );
    Ok(())
}

/// Every sheet of the workbook except `skip`, in workbook order
fn existing_sheets(path: &Path, skip: &str) -> Result<Vec<(String, Range<Data>)>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    workbook
        .sheet_names()
        .into_iter()
        .filter(|name| name != skip)
        .map(|name| -> Result<(String, Range<Data>)> {
            let range = workbook
                .worksheet_range(&name)
                .with_context(|| format!("Failed to read sheet '{name}'"))?;
            Ok((name, range))
        })
        .collect()
}

fn copy_range(worksheet: &mut Worksheet, range: &Range<Data>) -> Result<()> {
    let Some((top, left)) = range.start() else {
        return Ok(());
    };

    for (r, c, cell) in range.used_cells() {
        let row = row_number(top as usize + r)?;
        let col = u16::try_from(left as usize + c)?;
        match cell {
            Data::Int(value) => worksheet.write_number(row, col, *value as f64)?,
            Data::Float(value) => worksheet.write_number(row, col, *value)?,
            Data::Bool(value) => worksheet.write_boolean(row, col, *value)?,
            Data::DateTime(value) => worksheet.write_number(row, col, value.as_f64())?,
            Data::String(value) | Data::DateTimeIso(value) | Data::DurationIso(value) => {
                worksheet.write_string(row, col, value.as_str())?
            }
            Data::Error(_) | Data::Empty => continue,
        };
    }
    Ok(())
}

/// Rewrites the whole output workbook on every save
pub struct ExcelSink {
    path: PathBuf,
    sheet: String,
}

impl ExcelSink {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sheet: sheet.into(),
        }
    }

    fn write_rows(&self, rows: &[PriceRow]) -> Result<()> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(self.sheet.as_str())?;

        write_strings(worksheet, 0, &HEADER)?;
        for (index, row) in rows.iter().enumerate() {
            let r = row_number(index + 1)?;
            worksheet.write_string(r, 0, row.scraped_at.format(TIMESTAMP_FORMAT).to_string())?;
            worksheet.write_string(r, 1, row.cabinet.as_str())?;
            match row.article.parse::<f64>() {
                Ok(number) => worksheet.write_number(r, 2, number)?,
                Err(_) => worksheet.write_string(r, 2, row.article.as_str())?,
            };
            worksheet.write_string(r, 3, row.title.as_str())?;

            let numbers = [
                row.price_before_discount,
                row.price_after_discount,
                row.price_with_card,
                row.discount_percent,
                row.card_discount_percent,
                row.stock_count.map(|s| s as f64),
            ];
            for (offset, value) in numbers.into_iter().enumerate() {
                if let Some(value) = value {
                    worksheet.write_number(r, 4 + offset as u16, value)?;
                }
            }
            worksheet.write_string(r, 10, row.status.as_str())?;
        }

        save(&mut workbook, &self.path)
    }
}

#[async_trait]
impl ResultSink for ExcelSink {
    fn name(&self) -> &str {
        "excel"
    }

    async fn save(&self, all: &[PriceRow], _fresh: &[PriceRow]) -> Result<()> {
        self.write_rows(all)?;
        debug!("Wrote {} rows to {}", all.len(), self.path.display());
        Ok(())
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Int(value) => value.to_string(),
        Data::Float(value) if value.fract() == 0.0 => format!("{value:.0}"),
        Data::String(value) => value.clone(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn write_strings(worksheet: &mut Worksheet, row: u32, values: &[&str]) -> Result<()> {
    for (col, value) in values.iter().enumerate() {
        worksheet.write_string(row, col as u16, *value)?;
    }
    Ok(())
}

fn row_number(index: usize) -> Result<u32> {
    match u32::try_from(index) {
        Ok(row) if row < 1_048_576 => Ok(row),
        _ => bail!("Too many rows for one worksheet: {index}"),
    }
}

fn save(workbook: &mut Workbook, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))
}
