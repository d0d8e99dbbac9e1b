//! Document-type-specific field catalogs.
//!
//! Each spec names the canonical field, its value kind, whether a complete
//! document must carry it, and the label aliases (EN/DE/ES) that the anchor
//! and table extractors match against.

use captrace_model::DocType;

/// How a raw string becomes a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Money,
    Date,
    Text,
    Percent,
    Multiple,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Missing required fields downgrade the extraction to incomplete and
    /// add a critical audit entry; they never hard-fail the document.
    pub required: bool,
    pub aliases: &'static [&'static str],
}

const CAPITAL_ACCOUNT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "as_of_date",
        kind: FieldKind::Date,
        required: true,
        aliases: &[
            "as of date",
            "as of",
            "statement date",
            "reporting date",
            "period ending",
            "stichtag",
            "zum",
            "fecha de corte",
        ],
    },
    FieldSpec {
        name: "investor_name",
        kind: FieldKind::Text,
        required: false,
        aliases: &["investor", "limited partner", "partner name", "anleger", "inversor"],
    },
    FieldSpec {
        name: "fund_name",
        kind: FieldKind::Text,
        required: true,
        aliases: &["fund", "fund name", "partnership", "fonds", "fondo"],
    },
    FieldSpec {
        name: "reporting_currency",
        kind: FieldKind::Text,
        required: false,
        aliases: &["currency", "reporting currency", "währung", "waehrung", "moneda", "divisa"],
    },
    FieldSpec {
        name: "beginning_balance",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "beginning balance",
            "opening balance",
            "capital account at beginning",
            "beginning capital balance",
            "anfangssaldo",
            "anfangskapital",
            "saldo inicial",
        ],
    },
    FieldSpec {
        name: "ending_balance",
        kind: FieldKind::Money,
        required: true,
        aliases: &[
            "ending balance",
            "closing balance",
            "capital account at end",
            "ending capital balance",
            "net asset value",
            "endsaldo",
            "endkapital",
            "schlusssaldo",
            "saldo final",
        ],
    },
    FieldSpec {
        name: "contributions_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "contributions",
            "capital contributions",
            "capital called",
            "paid-in capital",
            "einzahlungen",
            "kapitalabrufe",
            "aportaciones",
        ],
    },
    FieldSpec {
        name: "distributions_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "distributions",
            "total distributions",
            "capital distributions",
            "ausschüttungen",
            "ausschuettungen",
            "distribuciones",
        ],
    },
    FieldSpec {
        name: "distributions_roc",
        kind: FieldKind::Money,
        required: false,
        aliases: &["return of capital", "capital returned", "kapitalrückzahlung"],
    },
    FieldSpec {
        name: "distributions_gain",
        kind: FieldKind::Money,
        required: false,
        aliases: &["realized gain distributions", "gain distributions"],
    },
    FieldSpec {
        name: "distributions_income",
        kind: FieldKind::Money,
        required: false,
        aliases: &["income distributions", "dividend distributions", "ertragsausschüttung"],
    },
    FieldSpec {
        name: "management_fees_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "management fees",
            "management fee",
            "verwaltungsgebühr",
            "verwaltungsgebuehren",
            "comisión de gestión",
            "comision de gestion",
        ],
    },
    FieldSpec {
        name: "partnership_expenses_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "partnership expenses",
            "fund expenses",
            "operating expenses",
            "fondskosten",
            "gastos del fondo",
        ],
    },
    FieldSpec {
        name: "realized_gain_loss_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "realized gain",
            "realized gains",
            "realized gain/(loss)",
            "net realized gain",
            "realisierte gewinne",
            "ganancias realizadas",
        ],
    },
    FieldSpec {
        name: "unrealized_gain_loss_period",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "unrealized gain",
            "unrealized gains",
            "unrealized gain/(loss)",
            "change in unrealized",
            "unrealisierte gewinne",
            "ganancias no realizadas",
        ],
    },
    FieldSpec {
        name: "total_commitment",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "total commitment",
            "committed capital",
            "capital commitment",
            "gesamtzusage",
            "zeichnungsbetrag",
            "compromiso total",
        ],
    },
    FieldSpec {
        name: "drawn_commitment",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "drawn commitment",
            "called commitment",
            "cumulative contributions",
            "abgerufenes kapital",
            "capital desembolsado",
        ],
    },
    FieldSpec {
        name: "unfunded_commitment",
        kind: FieldKind::Money,
        required: false,
        aliases: &[
            "unfunded commitment",
            "remaining commitment",
            "undrawn commitment",
            "offene zusage",
            "compromiso pendiente",
        ],
    },
];

const QUARTERLY_REPORT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "as_of_date",
        kind: FieldKind::Date,
        required: true,
        aliases: &["as of", "as of date", "reporting date", "quarter ended", "stichtag"],
    },
    FieldSpec {
        name: "fund_name",
        kind: FieldKind::Text,
        required: true,
        aliases: &["fund", "fund name", "partnership", "fonds"],
    },
    FieldSpec {
        name: "reporting_currency",
        kind: FieldKind::Text,
        required: false,
        aliases: &["currency", "reporting currency", "währung"],
    },
    FieldSpec {
        name: "fund_nav",
        kind: FieldKind::Money,
        required: true,
        aliases: &[
            "net asset value",
            "fund nav",
            "nav",
            "total net assets",
            "nettoinventarwert",
            "valor liquidativo",
        ],
    },
    FieldSpec {
        name: "irr_net",
        kind: FieldKind::Percent,
        required: false,
        aliases: &["net irr", "irr (net)", "irr", "interner zinsfuß"],
    },
    FieldSpec {
        name: "moic",
        kind: FieldKind::Multiple,
        required: false,
        aliases: &["moic", "multiple on invested capital", "gross multiple"],
    },
    FieldSpec {
        name: "tvpi",
        kind: FieldKind::Multiple,
        required: false,
        aliases: &["tvpi", "total value to paid-in", "total value / paid-in"],
    },
    FieldSpec {
        name: "dpi",
        kind: FieldKind::Multiple,
        required: false,
        aliases: &["dpi", "distributions to paid-in", "distributed / paid-in"],
    },
    FieldSpec {
        name: "rvpi",
        kind: FieldKind::Multiple,
        required: false,
        aliases: &["rvpi", "residual value to paid-in"],
    },
    FieldSpec {
        name: "called_pct",
        kind: FieldKind::Percent,
        required: false,
        aliases: &["called", "capital called %", "drawn %", "abgerufen %"],
    },
    FieldSpec {
        name: "distributed_pct",
        kind: FieldKind::Percent,
        required: false,
        aliases: &["distributed", "distributed %", "ausgeschüttet %"],
    },
];

const CAPITAL_CALL_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "as_of_date",
        kind: FieldKind::Date,
        required: false,
        aliases: &["notice date", "date of notice", "datum"],
    },
    FieldSpec {
        name: "due_date",
        kind: FieldKind::Date,
        required: false,
        aliases: &["due date", "payment due", "fällig am", "faellig am", "fecha de pago"],
    },
    FieldSpec {
        name: "call_amount",
        kind: FieldKind::Money,
        required: true,
        aliases: &[
            "call amount",
            "capital call amount",
            "amount due",
            "drawdown amount",
            "abrufbetrag",
            "importe solicitado",
        ],
    },
    FieldSpec {
        name: "fund_name",
        kind: FieldKind::Text,
        required: true,
        aliases: &["fund", "fund name", "partnership", "fonds"],
    },
    FieldSpec {
        name: "investor_name",
        kind: FieldKind::Text,
        required: false,
        aliases: &["investor", "limited partner", "anleger"],
    },
    FieldSpec {
        name: "reporting_currency",
        kind: FieldKind::Text,
        required: false,
        aliases: &["currency", "währung", "moneda"],
    },
];

const DISTRIBUTION_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "as_of_date",
        kind: FieldKind::Date,
        required: false,
        aliases: &["notice date", "date of notice", "datum"],
    },
    FieldSpec {
        name: "payment_date",
        kind: FieldKind::Date,
        required: false,
        aliases: &["payment date", "value date", "zahltag", "fecha de pago"],
    },
    FieldSpec {
        name: "distribution_amount",
        kind: FieldKind::Money,
        required: true,
        aliases: &[
            "distribution amount",
            "total distribution",
            "amount distributed",
            "ausschüttungsbetrag",
            "importe distribuido",
        ],
    },
    FieldSpec {
        name: "fund_name",
        kind: FieldKind::Text,
        required: true,
        aliases: &["fund", "fund name", "partnership", "fonds"],
    },
    FieldSpec {
        name: "investor_name",
        kind: FieldKind::Text,
        required: false,
        aliases: &["investor", "limited partner", "anleger"],
    },
    FieldSpec {
        name: "reporting_currency",
        kind: FieldKind::Text,
        required: false,
        aliases: &["currency", "währung", "moneda"],
    },
];

const GENERIC_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "as_of_date",
        kind: FieldKind::Date,
        required: false,
        aliases: &["as of", "date", "datum"],
    },
    FieldSpec {
        name: "fund_name",
        kind: FieldKind::Text,
        required: false,
        aliases: &["fund", "fund name", "partnership", "fonds"],
    },
    FieldSpec {
        name: "investor_name",
        kind: FieldKind::Text,
        required: false,
        aliases: &["investor", "limited partner"],
    },
];

/// The catalog for a classified document type.
pub fn catalog_for(doc_type: DocType) -> &'static [FieldSpec] {
    match doc_type {
        DocType::CapitalAccountStatement => CAPITAL_ACCOUNT_FIELDS,
        DocType::QuarterlyReport | DocType::AnnualReport => QUARTERLY_REPORT_FIELDS,
        DocType::CapitalCallNotice => CAPITAL_CALL_FIELDS,
        DocType::DistributionNotice => DISTRIBUTION_FIELDS,
        DocType::Subscription | DocType::Lpa | DocType::Ppm | DocType::Other => GENERIC_FIELDS,
    }
}

pub fn spec_by_name(doc_type: DocType, name: &str) -> Option<&'static FieldSpec> {
    catalog_for(doc_type).iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capital_account_catalog_carries_the_full_field_set() {
        let names: Vec<&str> = catalog_for(DocType::CapitalAccountStatement)
            .iter()
            .map(|s| s.name)
            .collect();
        for expected in [
            "as_of_date",
            "beginning_balance",
            "ending_balance",
            "contributions_period",
            "distributions_period",
            "management_fees_period",
            "partnership_expenses_period",
            "realized_gain_loss_period",
            "unrealized_gain_loss_period",
            "total_commitment",
            "drawn_commitment",
            "unfunded_commitment",
            "reporting_currency",
            "investor_name",
            "fund_name",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn required_fields_are_marked() {
        let spec = spec_by_name(DocType::CapitalAccountStatement, "ending_balance").unwrap();
        assert!(spec.required);
        let spec = spec_by_name(DocType::CapitalAccountStatement, "management_fees_period")
            .unwrap();
        assert!(!spec.required);
    }

    #[test]
    fn annual_reports_share_the_quarterly_catalog() {
        assert_eq!(
            catalog_for(DocType::AnnualReport).len(),
            catalog_for(DocType::QuarterlyReport).len()
        );
    }
}
