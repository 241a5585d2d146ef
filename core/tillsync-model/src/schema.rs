use crate::{ModelError, ModelResult, Record};
use tillsync_types::NaturalKey;

/// How the remote store decides that an incoming row replaces an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKey {
    /// The device-assigned `id`, scoped by the owning tenant. Ids are only
    /// unique within one tenant's data.
    Id,
    /// A composite natural key, in remote column names. Used for tables whose
    /// ids are not stable across devices.
    Columns(&'static [&'static str]),
}

impl ConflictKey {
    /// Column list in the form the remote `on_conflict` parameter expects.
    pub fn on_conflict(&self) -> String {
        match self {
            ConflictKey::Id => "tenant_id,id".to_string(),
            ConflictKey::Columns(cols) => cols.join(","),
        }
    }

    /// Remote column names making up the key.
    pub fn columns(&self) -> Vec<&'static str> {
        match self {
            ConflictKey::Id => vec!["tenant_id", "id"],
            ConflictKey::Columns(cols) => cols.to_vec(),
        }
    }
}

/// A reference from a child table to a parent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Local field on the child holding the parent id (e.g. `categoryId`).
    pub field: &'static str,
    /// Local name of the parent table.
    pub parent: &'static str,
    /// Optional denormalized copy of the parent's natural key kept on the
    /// child (e.g. `categoryName`), used to re-resolve dangling references.
    pub hint_field: Option<&'static str>,
    /// Required references are re-homed to a fallback parent when they cannot
    /// be resolved; optional ones are cleared instead.
    pub required: bool,
}

/// Declarative sync configuration for one entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Local table name.
    pub name: &'static str,
    /// Table name in the remote store.
    pub remote_table: &'static str,
    pub conflict_key: ConflictKey,
    /// Local field holding the natural key. Used to re-resolve dangling
    /// references that point at this table.
    pub natural_key: Option<&'static str>,
    /// Whether rows sharing a natural key are duplicates to be consolidated.
    pub consolidate: bool,
    /// Legacy natural-key values mapped to their canonical value
    /// (`(alias, canonical)`), compared after normalization.
    pub natural_key_aliases: &'static [(&'static str, &'static str)],
    /// Local-only or computed fields that must never reach the remote schema.
    pub deny_fields: &'static [&'static str],
    /// Field renames applied after case conversion, as `(local, remote)`.
    pub renames: &'static [(&'static str, &'static str)],
    /// Local fields holding timestamps (text on the wire).
    pub date_fields: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
}

impl TableSpec {
    /// Minimal spec: id conflict key, no transform rules.
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            remote_table: name,
            conflict_key: ConflictKey::Id,
            natural_key: None,
            consolidate: false,
            natural_key_aliases: &[],
            deny_fields: &[],
            renames: &[],
            date_fields: &[],
            foreign_keys: &[],
        }
    }

    pub fn is_date_field(&self, field: &str) -> bool {
        self.date_fields.contains(&field)
    }

    pub fn is_denied(&self, field: &str) -> bool {
        self.deny_fields.contains(&field)
    }

    /// Remote name for a local field after case conversion, if renamed.
    pub fn remote_rename(&self, local: &str) -> Option<&'static str> {
        self.renames
            .iter()
            .find(|(l, _)| *l == local)
            .map(|(_, r)| *r)
    }

    /// Local name for a remote column, if renamed.
    pub fn local_rename(&self, remote: &str) -> Option<&'static str> {
        self.renames
            .iter()
            .find(|(_, r)| *r == remote)
            .map(|(l, _)| *l)
    }

    /// Normalized natural key of a record, with aliases folded into their
    /// canonical value. `None` when the table has no natural key or the
    /// record's value is blank.
    pub fn natural_key_of(&self, record: &Record) -> Option<NaturalKey> {
        let field = self.natural_key?;
        self.normalize_key(record.get_str(field)?)
    }

    /// Normalizes a raw natural-key value the way [`Self::natural_key_of`] does.
    pub fn normalize_key(&self, raw: &str) -> Option<NaturalKey> {
        let key = NaturalKey::new(raw)?;
        for (alias, canonical) in self.natural_key_aliases {
            if NaturalKey::new(alias).as_ref() == Some(&key) {
                return NaturalKey::new(canonical);
            }
        }
        Some(key)
    }

    /// Display value for a canonical key, when the key is an alias target.
    pub fn canonical_name(&self, key: &NaturalKey) -> Option<&'static str> {
        self.natural_key_aliases
            .iter()
            .map(|(_, canonical)| *canonical)
            .find(|canonical| NaturalKey::new(canonical).as_ref() == Some(key))
    }

    pub fn foreign_key_to(&self, parent: &str) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.parent == parent)
    }
}

/// Ordered set of table specs. Parents always precede their children, which is
/// the order push and pull walk the tables in.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: Vec<TableSpec>,
}

impl TableRegistry {
    /// Builds a registry, checking that every foreign key points at a table
    /// registered earlier.
    pub fn new(tables: Vec<TableSpec>) -> ModelResult<Self> {
        for (idx, spec) in tables.iter().enumerate() {
            for fk in spec.foreign_keys {
                let earlier = tables[..idx].iter().any(|t| t.name == fk.parent);
                if !earlier {
                    return Err(ModelError::DependencyOrder {
                        child: spec.name.to_string(),
                        parent: fk.parent.to_string(),
                    });
                }
            }
        }
        Ok(Self { tables })
    }

    /// The built-in point-of-sale tables.
    pub fn standard() -> Self {
        Self {
            tables: STANDARD_TABLES.to_vec(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Like [`Self::get`], but an unknown name is an error.
    pub fn require(&self, name: &str) -> ModelResult<&TableSpec> {
        self.get(name)
            .ok_or_else(|| ModelError::UnknownTable(name.to_string()))
    }

    /// Tables in dependency order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|t| t.name).collect()
    }

    /// Every (child table, foreign key) pair referencing `parent`.
    pub fn dependents_of(&self, parent: &str) -> Vec<(&TableSpec, &ForeignKey)> {
        self.tables
            .iter()
            .flat_map(|t| t.foreign_key_to(parent).map(move |fk| (t, fk)))
            .collect()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

const TIMESTAMPS: &[&str] = &["createdAt", "updatedAt"];

static STANDARD_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "categories",
        remote_table: "categories",
        conflict_key: ConflictKey::Id,
        natural_key: Some("name"),
        consolidate: true,
        natural_key_aliases: &[("Bebidas", "Bebidas y Jugos")],
        deny_fields: &["productCount"],
        renames: &[],
        date_fields: TIMESTAMPS,
        foreign_keys: &[],
    },
    TableSpec {
        name: "products",
        remote_table: "products",
        conflict_key: ConflictKey::Id,
        natural_key: Some("name"),
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &["imagePreview", "stockAlert"],
        renames: &[("price", "unit_price")],
        date_fields: TIMESTAMPS,
        foreign_keys: &[ForeignKey {
            field: "categoryId",
            parent: "categories",
            hint_field: Some("categoryName"),
            required: true,
        }],
    },
    TableSpec {
        name: "ingredients",
        remote_table: "ingredients",
        conflict_key: ConflictKey::Columns(&["tenant_id", "name"]),
        natural_key: Some("name"),
        consolidate: true,
        natural_key_aliases: &[],
        deny_fields: &[],
        renames: &[("stock", "stock_quantity")],
        date_fields: &["createdAt", "updatedAt", "lastRestockedAt"],
        foreign_keys: &[],
    },
    TableSpec {
        name: "product_ingredients",
        remote_table: "product_ingredients",
        conflict_key: ConflictKey::Id,
        natural_key: None,
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &[],
        renames: &[],
        date_fields: TIMESTAMPS,
        foreign_keys: &[
            ForeignKey {
                field: "productId",
                parent: "products",
                hint_field: Some("productName"),
                required: true,
            },
            ForeignKey {
                field: "ingredientId",
                parent: "ingredients",
                hint_field: Some("ingredientName"),
                required: true,
            },
        ],
    },
    TableSpec {
        name: "customers",
        remote_table: "customers",
        conflict_key: ConflictKey::Id,
        natural_key: None,
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &[],
        renames: &[],
        date_fields: TIMESTAMPS,
        foreign_keys: &[],
    },
    TableSpec {
        name: "orders",
        remote_table: "orders",
        conflict_key: ConflictKey::Id,
        natural_key: None,
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &["uiState", "isPrinting"],
        renames: &[("total", "total_amount")],
        date_fields: &["createdAt", "updatedAt", "closedAt"],
        foreign_keys: &[ForeignKey {
            field: "customerId",
            parent: "customers",
            hint_field: None,
            required: false,
        }],
    },
    TableSpec {
        name: "order_items",
        remote_table: "order_items",
        conflict_key: ConflictKey::Id,
        natural_key: None,
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &[],
        renames: &[],
        date_fields: TIMESTAMPS,
        foreign_keys: &[
            ForeignKey {
                field: "orderId",
                parent: "orders",
                hint_field: None,
                required: true,
            },
            ForeignKey {
                field: "productId",
                parent: "products",
                hint_field: Some("productName"),
                required: true,
            },
        ],
    },
    TableSpec {
        name: "employees",
        remote_table: "employees",
        conflict_key: ConflictKey::Id,
        natural_key: Some("name"),
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &[],
        renames: &[],
        date_fields: &["hiredAt", "createdAt", "updatedAt"],
        foreign_keys: &[],
    },
    TableSpec {
        name: "payroll_entries",
        remote_table: "payroll_entries",
        conflict_key: ConflictKey::Id,
        natural_key: None,
        consolidate: false,
        natural_key_aliases: &[],
        deny_fields: &["draftCalculation"],
        renames: &[],
        date_fields: &["periodStart", "periodEnd", "paidAt", "createdAt"],
        foreign_keys: &[ForeignKey {
            field: "employeeId",
            parent: "employees",
            hint_field: Some("employeeName"),
            required: true,
        }],
    },
];
