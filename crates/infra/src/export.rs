//! Tabular export of purchases as CSV with localized headers.

use chrono::{DateTime, NaiveDate, Utc};

use procura_purchasing::Purchase;

use crate::store::StoreError;

type Cell = fn(&Purchase) -> String;

const COLUMNS: &[(&str, Cell)] = &[
    ("Вход. №", |p| text(p.entry_number())),
    ("Статус", |p| p.status().label().to_string()),
    ("Дата изм. статуса", |p| date(p.last_status_changed_at())),
    ("Площадка", |p| text(p.attributes().site.map(|s| s.label()))),
    ("Категория", |p| text(p.attributes().category.map(|c| c.label()))),
    ("Предмет договора", |p| text(p.attributes().contract_subject.as_deref())),
    ("Поставщик", |p| text(p.attributes().supplier_name.as_deref())),
    ("СМП", |p| yes_no(p.attributes().smp)),
    ("ИНН", |p| text(p.attributes().supplier_inn.as_deref())),
    ("НМЦ", |p| amount(p.attributes().initial_price)),
    ("Сумма закупки", |p| amount(p.attributes().purchase_amount)),
    ("Номер договора", |p| text(p.attributes().contract_number.as_deref())),
    ("Дата заключения", |p| date(p.attributes().contract_date)),
    ("Срок действия с", |p| date(p.attributes().valid_from)),
    ("по", |p| date(p.attributes().valid_to)),
    ("Исполнение до", |p| date(p.attributes().contract_end)),
    ("Дата размещения", |p| date(p.attributes().placement_date)),
    ("Способ закупки", |p| text(p.attributes().method_of_purchase.as_deref())),
    ("Документ (№, дата)", |p| text(p.attributes().document_number.as_deref())),
    ("Состоялась", |p| yes_no(Some(p.completed()))),
    ("Экономия", |p| amount(p.attributes().savings)),
    ("Сумма исполнения", |p| amount(p.attributes().performance_amount)),
    ("Форма обеспечения", |p| text(p.attributes().performance_form.as_deref())),
    ("Номер ДС", |p| text(p.attributes().additional_agreement_number.as_deref())),
    ("Актуальная сумма", |p| amount(p.attributes().current_contract_amount)),
    ("Остаток по договору", |p| amount(Some(p.remaining_contract_amount().unwrap_or(0.0)))),
    ("БГ: с", |p| date(p.attributes().bank_guarantee_valid_from)),
    ("БГ: по", |p| date(p.attributes().bank_guarantee_valid_to)),
    ("Размещение", |p| text(p.attributes().publication.as_deref())),
    ("Ответственный", |p| text(p.attributes().responsible.as_deref())),
    ("№ по плану", |p| text(p.attributes().plan_number.as_deref())),
    ("Обеспечение заявки", |p| amount(p.attributes().application_amount)),
    ("Примечания", |p| text(p.attributes().comment.as_deref())),
];

fn text(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn date(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.format("%d.%m.%Y").to_string())
        .unwrap_or_default()
}

fn yes_no(value: Option<bool>) -> String {
    match value {
        Some(true) => "Да".to_string(),
        Some(false) => "Нет".to_string(),
        None => String::new(),
    }
}

fn amount(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// A rendered export ready to be served as a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub content: Vec<u8>,
}

impl ExportFile {
    pub fn file_name_for(day: NaiveDate) -> String {
        format!("purchases-{}.csv", day.format("%Y-%m-%d"))
    }
}

/// Render purchases as CSV, one header row followed by one row per purchase.
pub fn render_csv(purchases: &[Purchase]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(COLUMNS.iter().map(|(header, _)| *header))
        .map_err(|e| StoreError::backend("render_csv", e))?;
    for purchase in purchases {
        writer
            .write_record(COLUMNS.iter().map(|(_, cell)| cell(purchase)))
            .map_err(|e| StoreError::backend("render_csv", e))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::backend("render_csv", e.to_string()))
}
