//! Reference data the detection reads but never writes: machines, operations,
//! sequences, components, work orders and manufacturing orders.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use pd_core::{
    ComponentId, MachineId, MachineModuleId, ManufacturingOrder, Operation, OperationId, Sequence,
    WorkOrderId, WorkPieceId,
};

use crate::{Database, DbError, id_column, optional_id_column};

/// A machine with its modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub modules: Vec<MachineModuleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: ComponentId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub intermediate_work_pieces: Vec<WorkPieceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderRecord {
    pub id: WorkOrderId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentId>,
}

/// A reference data document, as loaded by `pd reference`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    pub machines: Vec<MachineRecord>,
    pub operations: Vec<Operation>,
    pub sequences: Vec<Sequence>,
    pub components: Vec<ComponentRecord>,
    pub work_orders: Vec<WorkOrderRecord>,
    pub manufacturing_orders: Vec<ManufacturingOrder>,
}

impl Database {
    /// Loads a reference data document in one transaction.
    ///
    /// Existing rows with the same ids are updated.
    pub fn load_reference(&mut self, data: &ReferenceData) -> Result<(), DbError> {
        self.begin("load_reference", pd_core::TransactionOptions::new())?;
        match self.insert_reference(data) {
            Ok(()) => self.end(true),
            Err(err) => {
                self.end(false)?;
                Err(err)
            }
        }
    }

    fn insert_reference(&self, data: &ReferenceData) -> Result<(), DbError> {
        for machine in &data.machines {
            self.insert_machine(machine.id, machine.name.as_deref())?;
            for module in &machine.modules {
                self.insert_machine_module(*module, machine.id)?;
            }
        }
        for operation in &data.operations {
            self.insert_operation(operation)?;
        }
        for sequence in &data.sequences {
            self.insert_sequence(sequence)?;
        }
        for component in &data.components {
            self.insert_component(component)?;
        }
        for work_order in &data.work_orders {
            self.insert_work_order(work_order)?;
        }
        for manufacturing_order in &data.manufacturing_orders {
            self.insert_manufacturing_order(manufacturing_order)?;
        }
        Ok(())
    }

    pub fn insert_machine(&self, id: MachineId, name: Option<&str>) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO machines (id, name) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![id.get(), name],
        )?;
        Ok(())
    }

    pub fn insert_machine_module(
        &self,
        id: MachineModuleId,
        machine: MachineId,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO machine_modules (id, machine_id) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET machine_id = excluded.machine_id
            ",
            params![id.get(), machine.get()],
        )?;
        Ok(())
    }

    pub fn insert_operation(&self, operation: &Operation) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO operations (id, code, name) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET code = excluded.code, name = excluded.name
            ",
            params![operation.id.get(), operation.code, operation.name],
        )?;
        for work_piece in &operation.intermediate_work_pieces {
            self.conn.execute(
                "INSERT OR IGNORE INTO operation_work_pieces (operation_id, work_piece_id) VALUES (?1, ?2)",
                params![operation.id.get(), work_piece.get()],
            )?;
        }
        Ok(())
    }

    pub fn insert_sequence(&self, sequence: &Sequence) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO sequences (id, operation_id, name, auto_only) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                operation_id = excluded.operation_id,
                name = excluded.name,
                auto_only = excluded.auto_only
            ",
            params![
                sequence.id.get(),
                sequence.operation.get(),
                sequence.name,
                sequence.auto_only
            ],
        )?;
        Ok(())
    }

    pub fn insert_component(&self, component: &ComponentRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO components (id, name) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![component.id.get(), component.name],
        )?;
        for work_piece in &component.intermediate_work_pieces {
            self.conn.execute(
                "INSERT OR IGNORE INTO component_work_pieces (component_id, work_piece_id) VALUES (?1, ?2)",
                params![component.id.get(), work_piece.get()],
            )?;
        }
        Ok(())
    }

    pub fn insert_work_order(&self, work_order: &WorkOrderRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO work_orders (id, name) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            ",
            params![work_order.id.get(), work_order.name],
        )?;
        for component in &work_order.components {
            self.conn.execute(
                "INSERT OR IGNORE INTO work_order_components (work_order_id, component_id) VALUES (?1, ?2)",
                params![work_order.id.get(), component.get()],
            )?;
        }
        Ok(())
    }

    pub fn insert_manufacturing_order(&self, order: &ManufacturingOrder) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO manufacturing_orders
                (id, operation_id, machine_id, order_index, work_order_id, component_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                operation_id = excluded.operation_id,
                machine_id = excluded.machine_id,
                order_index = excluded.order_index,
                work_order_id = excluded.work_order_id,
                component_id = excluded.component_id
            ",
            params![
                order.id.get(),
                order.operation.get(),
                order.machine.map(MachineId::get),
                order.order,
                order.work_order.map(WorkOrderId::get),
                order.component.map(ComponentId::get),
            ],
        )?;
        Ok(())
    }

    // ========== Lookups ==========

    pub(crate) fn find_operation(&self, id: OperationId) -> Result<Option<Operation>, DbError> {
        let operation = self
            .conn
            .query_row(
                "SELECT id, code, name FROM operations WHERE id = ?",
                [id.get()],
                |row| {
                    Ok(Operation {
                        id: id_column(row, 0)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                        intermediate_work_pieces: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut operation) = operation else {
            return Ok(None);
        };
        operation.intermediate_work_pieces = self.operation_work_pieces(id)?;
        Ok(Some(operation))
    }

    pub(crate) fn find_operations_by_code(&self, code: &str) -> Result<Vec<Operation>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM operations WHERE code = ? ORDER BY id ASC")?;
        let rows = stmt.query_map([code], |row| id_column::<OperationId>(row, 0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        let mut operations = Vec::with_capacity(ids.len());
        for id in ids {
            operations.extend(self.find_operation(id)?);
        }
        Ok(operations)
    }

    pub(crate) fn create_operation_with_code(&self, code: &str) -> Result<Operation, DbError> {
        self.conn.execute(
            "INSERT INTO operations (code, name) VALUES (?1, ?1)",
            [code],
        )?;
        let id = OperationId::new(self.conn.last_insert_rowid())?;
        Ok(Operation {
            id,
            code: Some(code.to_string()),
            name: Some(code.to_string()),
            intermediate_work_pieces: Vec::new(),
        })
    }

    fn operation_work_pieces(&self, operation: OperationId) -> Result<Vec<WorkPieceId>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT work_piece_id FROM operation_work_pieces WHERE operation_id = ? ORDER BY work_piece_id",
        )?;
        let rows = stmt.query_map([operation.get()], |row| id_column(row, 0))?;
        let mut work_pieces = Vec::new();
        for row in rows {
            work_pieces.push(row?);
        }
        Ok(work_pieces)
    }

    pub(crate) fn find_sequence(
        &self,
        id: pd_core::SequenceId,
    ) -> Result<Option<Sequence>, DbError> {
        let sequence = self
            .conn
            .query_row(
                "SELECT id, operation_id, name, auto_only FROM sequences WHERE id = ?",
                [id.get()],
                |row| {
                    Ok(Sequence {
                        id: id_column(row, 0)?,
                        operation: id_column(row, 1)?,
                        name: row.get(2)?,
                        auto_only: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(sequence)
    }

    pub(crate) fn find_machine_modules(
        &self,
        machine: MachineId,
    ) -> Result<Vec<MachineModuleId>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM machine_modules WHERE machine_id = ? ORDER BY id ASC")?;
        let rows = stmt.query_map([machine.get()], |row| id_column(row, 0))?;
        let mut modules = Vec::new();
        for row in rows {
            modules.push(row?);
        }
        Ok(modules)
    }

    /// Components sharing an intermediate work piece with the operation.
    fn components_of_operation(&self, operation: OperationId) -> Result<Vec<ComponentId>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT cwp.component_id
            FROM component_work_pieces cwp
            JOIN operation_work_pieces owp ON owp.work_piece_id = cwp.work_piece_id
            WHERE owp.operation_id = ?
            ORDER BY cwp.component_id
            ",
        )?;
        let rows = stmt.query_map([operation.get()], |row| id_column(row, 0))?;
        let mut components = Vec::new();
        for row in rows {
            components.push(row?);
        }
        Ok(components)
    }

    pub(crate) fn guess_component(
        &self,
        operation: OperationId,
    ) -> Result<Option<ComponentId>, DbError> {
        let components = self.components_of_operation(operation)?;
        Ok(match components.as_slice() {
            [component] => Some(*component),
            _ => None,
        })
    }

    pub(crate) fn guess_work_order(
        &self,
        operation: OperationId,
    ) -> Result<Option<WorkOrderId>, DbError> {
        let Some(component) = self.guess_component(operation)? else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT work_order_id FROM work_order_components WHERE component_id = ? ORDER BY work_order_id",
        )?;
        let rows = stmt.query_map([component.get()], |row| id_column(row, 0))?;
        let mut work_orders: Vec<WorkOrderId> = Vec::new();
        for row in rows {
            work_orders.push(row?);
        }
        Ok(match work_orders.as_slice() {
            [work_order] => Some(*work_order),
            _ => None,
        })
    }

    pub(crate) fn operation_shares_work_piece(
        &self,
        operation: OperationId,
        component: ComponentId,
    ) -> Result<bool, DbError> {
        let shared: bool = self.conn.query_row(
            "
            SELECT EXISTS (
                SELECT 1
                FROM operation_work_pieces owp
                JOIN component_work_pieces cwp ON cwp.work_piece_id = owp.work_piece_id
                WHERE owp.operation_id = ?1 AND cwp.component_id = ?2
            )
            ",
            params![operation.get(), component.get()],
            |row| row.get(0),
        )?;
        Ok(shared)
    }

    /// Orders of the operation, the ones planned on `machine` first by queue position.
    pub(crate) fn find_next_manufacturing_orders(
        &self,
        machine: MachineId,
        operation: OperationId,
    ) -> Result<Vec<ManufacturingOrder>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, operation_id, machine_id, order_index, work_order_id, component_id
            FROM manufacturing_orders
            WHERE operation_id = ?1 AND (machine_id IS NULL OR machine_id = ?2)
            ORDER BY machine_id IS NULL ASC, order_index IS NULL ASC, order_index ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(params![operation.get(), machine.get()], |row| {
            Ok(ManufacturingOrder {
                id: id_column(row, 0)?,
                operation: id_column(row, 1)?,
                machine: optional_id_column(row, 2)?,
                order: row.get(3)?,
                work_order: optional_id_column(row, 4)?,
                component: optional_id_column(row, 5)?,
            })
        })?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row?);
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReferenceData {
        serde_json::from_str(
            r#"{
                "machines": [{"id": 1, "name": "lathe", "modules": [10, 11]}],
                "operations": [
                    {"id": 100, "code": "OP-A", "name": "Roughing", "intermediate_work_pieces": [7]},
                    {"id": 101, "code": "OP-B", "name": "Finishing", "intermediate_work_pieces": [8]}
                ],
                "sequences": [{"id": 500, "operation": 100, "name": "S1"}],
                "components": [{"id": 20, "intermediate_work_pieces": [7]}],
                "work_orders": [{"id": 30, "components": [20]}],
                "manufacturing_orders": [
                    {"id": 40, "operation": 100, "machine": null, "order": null, "work_order": 30, "component": 20},
                    {"id": 41, "operation": 100, "machine": 1, "order": 2, "work_order": 30, "component": 20}
                ]
            }"#,
        )
        .expect("parse reference data")
    }

    fn loaded() -> Database {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        db.load_reference(&sample()).expect("load reference");
        db
    }

    // ========== Load Tests ==========

    #[test]
    fn load_reference_is_repeatable() {
        let mut db = loaded();
        db.load_reference(&sample()).expect("reload reference");
        let machine = MachineId::new(1).unwrap();
        assert_eq!(db.find_machine_modules(machine).unwrap().len(), 2);
        assert_eq!(db.machines().unwrap().len(), 1);
    }

    #[test]
    fn operation_carries_work_pieces() {
        let db = loaded();
        let operation = db
            .find_operation(OperationId::new(100).unwrap())
            .unwrap()
            .expect("operation 100");
        assert_eq!(operation.code.as_deref(), Some("OP-A"));
        assert_eq!(operation.intermediate_work_pieces, vec![WorkPieceId::new(7).unwrap()]);
    }

    // ========== Guess Tests ==========

    #[test]
    fn component_and_work_order_guessed_from_work_pieces() {
        let db = loaded();
        let operation = OperationId::new(100).unwrap();
        assert_eq!(db.guess_component(operation).unwrap(), Some(ComponentId::new(20).unwrap()));
        assert_eq!(db.guess_work_order(operation).unwrap(), Some(WorkOrderId::new(30).unwrap()));
        assert_eq!(db.guess_component(OperationId::new(101).unwrap()).unwrap(), None);
    }

    #[test]
    fn compatibility_requires_shared_work_piece() {
        let db = loaded();
        let component = ComponentId::new(20).unwrap();
        assert!(db.operation_shares_work_piece(OperationId::new(100).unwrap(), component).unwrap());
        assert!(!db.operation_shares_work_piece(OperationId::new(101).unwrap(), component).unwrap());
    }

    #[test]
    fn machine_orders_come_first() {
        let db = loaded();
        let orders = db
            .find_next_manufacturing_orders(MachineId::new(1).unwrap(), OperationId::new(100).unwrap())
            .unwrap();
        let ids: Vec<i64> = orders.iter().map(|order| order.id.get()).collect();
        assert_eq!(ids, vec![41, 40]);
    }

    #[test]
    fn created_operation_is_found_by_code() {
        let db = loaded();
        let created = db.create_operation_with_code("OP-NEW").unwrap();
        let found = db.find_operations_by_code("OP-NEW").unwrap();
        assert_eq!(found, vec![created]);
    }
}
