//-
// Copyright (c) 2022, The Mettmail Developers
//
// This file is part of Mettmail.
//
// Mettmail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, version 3 of the License.
//
// Mettmail is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mettmail. If not, see <http://www.gnu.org/licenses/>.


pub mod main;
mod run;
