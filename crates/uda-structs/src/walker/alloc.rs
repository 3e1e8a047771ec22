// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tracked allocation helpers for building structure data to send.
//!
//! Every helper allocates in the context heap and records the block in the
//! ledger with the count, size and type name the walker needs to send it
//! back out.

use super::SerializationContext;
use crate::error::{ProtocolError, Result};
use crate::heap::{Address, Scalar};
use crate::registry::{CompoundField, UserDefinedType};
use crate::types::POINTER_SIZE;
use std::sync::Arc;

impl SerializationContext {
    /// Copy `values` into a new tracked array.
    pub fn alloc_array<T: Scalar>(&mut self, values: &[T]) -> Result<Address> {
        let addr = self.heap.alloc(values.len() * T::SIZE);
        self.heap.write_slice(addr, values)?;
        self.ledger
            .register(addr, values.len(), T::SIZE, T::ATOMIC.c_name());
        Ok(addr)
    }

    /// Like [`SerializationContext::alloc_array`], recording rank and shape.
    pub fn alloc_shaped_array<T: Scalar>(&mut self, values: &[T], shape: &[usize]) -> Result<Address> {
        let count: usize = shape.iter().product();
        if count != values.len() {
            return Err(ProtocolError::protocol(format!(
                "shape {:?} does not describe {} values",
                shape,
                values.len()
            )));
        }
        let addr = self.heap.alloc(values.len() * T::SIZE);
        self.heap.write_slice(addr, values)?;
        self.ledger.register_with_shape(
            addr,
            values.len(),
            T::SIZE,
            T::ATOMIC.c_name(),
            shape.len(),
            shape,
        );
        Ok(addr)
    }

    /// Tracked NUL terminated copy of `text`.
    pub fn alloc_string(&mut self, text: &str) -> Address {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let addr = self.heap.alloc_bytes(&bytes);
        self.ledger.register(addr, bytes.len(), 1, "char");
        addr
    }

    /// Tracked array of string pointers, each string tracked as well.
    pub fn alloc_strings(&mut self, texts: &[&str]) -> Result<Address> {
        let list = self.heap.alloc(texts.len() * POINTER_SIZE);
        for (i, text) in texts.iter().enumerate() {
            let s = self.alloc_string(text);
            self.heap.write_ptr(list.checked_offset(i * POINTER_SIZE)?, Some(s))?;
        }
        self.ledger
            .register(list, texts.len(), POINTER_SIZE, "STRING *");
        Ok(list)
    }

    /// Zeroed, tracked array of `count` structures of `type_name`.
    pub fn alloc_structs(&mut self, type_name: &str, count: usize) -> Result<Address> {
        let udt = self.user_type(type_name)?;
        let addr = self.heap.alloc(count * udt.size);
        self.ledger.register(addr, count, udt.size, &udt.name);
        Ok(addr)
    }

    /// Store `target` in the pointer slot at `slot`.
    pub fn set_pointer(&mut self, slot: Address, target: Option<Address>) -> Result<()> {
        self.heap.write_ptr(slot, target)
    }

    /// Address of `field` inside the structure of `type_name` at `element`.
    pub fn field_address(&self, type_name: &str, element: Address, field: &str) -> Result<Address> {
        let udt = self.user_type(type_name)?;
        let f = lookup_field(&udt, field)?;
        element.checked_offset(f.offset)
    }

    /// Write a scalar into `field` of the structure at `element`.
    pub fn set_field<T: Scalar>(
        &mut self,
        type_name: &str,
        element: Address,
        field: &str,
        value: T,
    ) -> Result<()> {
        let addr = self.field_address(type_name, element, field)?;
        self.heap.write(addr, value)
    }

    /// Read a scalar from `field` of the structure at `element`.
    pub fn get_field<T: Scalar>(&self, type_name: &str, element: Address, field: &str) -> Result<T> {
        self.heap.read(self.field_address(type_name, element, field)?)
    }

    /// Store a pointer into `field` of the structure at `element`.
    pub fn set_field_pointer(
        &mut self,
        type_name: &str,
        element: Address,
        field: &str,
        target: Option<Address>,
    ) -> Result<()> {
        let addr = self.field_address(type_name, element, field)?;
        self.heap.write_ptr(addr, target)
    }

    /// Pointer held by `field` of the structure at `element`.
    pub fn get_field_pointer(
        &self,
        type_name: &str,
        element: Address,
        field: &str,
    ) -> Result<Option<Address>> {
        self.heap.read_ptr(self.field_address(type_name, element, field)?)
    }

    /// Copy `text` into the inline `char[N]` `field`.
    pub fn set_field_text(
        &mut self,
        type_name: &str,
        element: Address,
        field: &str,
        text: &str,
    ) -> Result<()> {
        let udt = self.user_type(type_name)?;
        let f = lookup_field(&udt, field)?;
        self.heap
            .store_c_string(element.checked_offset(f.offset)?, f.space(), text.as_bytes())
    }

    fn user_type(&self, type_name: &str) -> Result<Arc<UserDefinedType>> {
        self.registry
            .find(type_name)
            .ok_or_else(|| ProtocolError::UnknownType(type_name.to_string()))
    }
}

fn lookup_field<'a>(udt: &'a UserDefinedType, name: &str) -> Result<&'a CompoundField> {
    udt.field(name).ok_or_else(|| {
        ProtocolError::protocol(format!("structure {} has no field {}", udt.name, name))
    })
}
